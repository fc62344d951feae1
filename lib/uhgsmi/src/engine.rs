// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::slice;
use std::sync::{Arc, Mutex};

use kmt_api::*;
use slog::{debug, error, info, o, warn, Logger};

use crate::buffer::Buffer;
use crate::submit::{self, Resolved, SubmitEntry};
use crate::sync::SyncKind;
use crate::{EngineConfig, Error, Mode, Result};

/// Submission engine bound to one adapter, device and context.
pub struct Engine {
    pub(crate) callbacks: Callbacks,
    pub(crate) log: Logger,
    pub(crate) device: Device,
    host: Arc<dyn Host>,
    config: EngineConfig,
    adapter: Adapter,
    context: Mutex<Context>,
    context_handle: D3DKMT_HANDLE,
    torn_down: bool,
}

impl Engine {
    /// Engine which allocates, locks and submits through the render thunks.
    pub fn create_direct(
        kind: ContextKind,
        loader: &dyn Loader,
        host: Arc<dyn Host>,
        log: &Logger,
    ) -> Result<Self> {
        let config = EngineConfig {
            mode: Mode::Direct,
            context: kind,
            ..Default::default()
        };
        Self::create(config, loader, host, log)
    }

    /// Engine which does all of its work through driver escapes.
    pub fn create_escape(
        kind: ContextKind,
        loader: &dyn Loader,
        host: Arc<dyn Host>,
        log: &Logger,
    ) -> Result<Self> {
        let config = EngineConfig {
            mode: Mode::Escape,
            context: kind,
            ..Default::default()
        };
        Self::create(config, loader, host, log)
    }

    /// Load the driver thunks and open an adapter, device and context.
    ///
    /// Whatever was set up before a failing step is torn down again before
    /// the error is returned.
    pub fn create(
        config: EngineConfig,
        loader: &dyn Loader,
        host: Arc<dyn Host>,
        log: &Logger,
    ) -> Result<Self> {
        let log = log.new(o!(
            "component" => "uhgsmi",
            "mode" => config.mode.as_str(),
        ));

        let mut callbacks = Callbacks::new();
        callbacks.init(loader, &config.driver_module)?;

        let adapter = match &config.display {
            Some(name) => callbacks.open_adapter_from_display_name(name),
            None => callbacks.open_adapter(host.as_ref()),
        };
        let adapter = match adapter {
            Ok(adapter) => adapter,
            Err(e) => {
                callbacks.term();
                return Err(e.into());
            }
        };

        let device = match callbacks.create_device(&adapter) {
            Ok(device) => device,
            Err(e) => {
                unwind(&mut callbacks, host.as_ref(), &log, None, &adapter);
                return Err(e.into());
            }
        };

        let context = match callbacks.create_context(&device, config.context)
        {
            Ok(context) => context,
            Err(e) => {
                unwind(
                    &mut callbacks,
                    host.as_ref(),
                    &log,
                    Some(&device),
                    &adapter,
                );
                return Err(e.into());
            }
        };

        info!(log, "engine created";
            "adapter" => adapter.handle,
            "device" => device.handle,
            "context" => context.handle,
            "kind" => ?config.context);

        Ok(Self {
            callbacks,
            log,
            device,
            host,
            context_handle: context.handle,
            context: Mutex::new(context),
            adapter,
            config,
            torn_down: false,
        })
    }

    /// Tear down the context, device, adapter and thunk table, in that order.
    ///
    /// Every step is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first = None;
        let mut note = |what: &str, res: kmt_api::Result<()>| {
            if let Err(e) = res {
                warn!(self.log, "teardown step failed";
                    "step" => what, "error" => %e);
                first.get_or_insert(Error::from(e));
            }
        };

        let context =
            self.context.get_mut().unwrap_or_else(|e| e.into_inner());
        note("context", self.callbacks.destroy_context(context));
        note("device", self.callbacks.destroy_device(&self.device));
        note(
            "adapter",
            self.callbacks.close_adapter(self.host.as_ref(), &self.adapter),
        );
        self.callbacks.term();

        match first {
            None => {
                debug!(self.log, "engine destroyed");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Create a buffer of at least `cb` bytes.
    ///
    /// With a `sync_kind` other than [`SyncKind::None`] and no `sync_handle`,
    /// a sync object is created for (and owned by) the buffer.
    pub fn buffer_create(
        &self,
        cb: u32,
        sync_kind: SyncKind,
        sync_handle: Option<HANDLE>,
    ) -> Result<Buffer<'_>> {
        Buffer::create(self, cb, sync_kind, sync_handle)
    }

    /// Hand a batch of buffer references to the host for execution.
    ///
    /// Completion is signalled through the buffers' sync objects.
    pub fn submit_async(&self, entries: &[SubmitEntry<'_, '_>]) -> Result<()> {
        if self.config.mode == Mode::Escape
            && entries.len() > self.config.escape_batch_limit
        {
            return Err(Error::InvalidArgument(
                "too many buffers for a submit escape",
            ));
        }
        let resolved = submit::resolve(self, entries)?;
        match self.config.mode {
            Mode::Direct => self.submit_direct(&resolved),
            Mode::Escape => self.submit_escape(&resolved),
        }
    }

    fn submit_direct(&self, entries: &[Resolved]) -> Result<()> {
        let thunks = self.callbacks.thunks()?;
        let mut context = self.context.lock().unwrap();

        let bufs = context.buffers;
        let len = {
            // Safety: the buffers were handed to this context by the driver
            // and remain ours until the next render.  The context lock keeps
            // any other submission from touching them meanwhile.
            let command = unsafe {
                driver_slice(bufs.command.cast::<u8>(), bufs.command_size)
            };
            let allocations = unsafe {
                driver_slice(bufs.allocation_list, bufs.allocation_list_size)
            };
            let patches =
                unsafe { driver_slice(bufs.patch_list, bufs.patch_list_size) };
            submit::dma_fill(command, allocations, patches, entries)?
        };
        if len == 0 || len >= (u32::MAX / 2) as usize {
            return Err(Error::InvalidArgument("command length out of range"));
        }

        let count = entries.len() as u32;
        let mut render = D3DKMT_RENDER {
            hContext: context.handle,
            CommandLength: len as u32,
            AllocationCount: count,
            PatchLocationCount: count,
            ..Default::default()
        };
        // Safety: the request carries no input pointers
        check_status("D3DKMTRender", unsafe { thunks.render(&mut render) })?;
        context.rotate(&render);

        debug!(self.log, "render submitted";
            "buffers" => count, "length" => len);
        Ok(())
    }

    fn submit_escape(&self, entries: &[Resolved]) -> Result<()> {
        let mut payload = submit::escape_payload(entries);
        self.escape(&mut payload)?;
        debug!(self.log, "escape submitted"; "buffers" => entries.len());
        Ok(())
    }

    /// Issue a driver-private escape on this engine's adapter, device and
    /// context.  The driver may write its reply into `data`.
    pub(crate) fn escape(&self, data: &mut [u8]) -> kmt_api::Result<()> {
        let thunks = self.callbacks.thunks()?;
        let mut req = D3DKMT_ESCAPE {
            hAdapter: self.adapter.handle,
            hDevice: self.device.handle,
            Type: D3DKMT_ESCAPE_DRIVERPRIVATE,
            Flags: 0,
            pPrivateDriverData: data.as_mut_ptr().cast(),
            PrivateDriverDataSize: data.len() as u32,
            hContext: self.context_handle,
        };
        // Safety: the private data is `data`, valid for its whole length
        check_status("D3DKMTEscape", unsafe { thunks.escape(&mut req) })
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context_handle(&self) -> D3DKMT_HANDLE {
        self.context_handle
    }

    /// DMA buffers the next direct submission will be encoded into.
    pub fn dma_buffers(&self) -> DmaBuffers {
        self.context.lock().unwrap().buffers
    }

    pub(crate) fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!(self.log, "engine teardown failed"; "error" => %e);
        }
    }
}

/// Release what [`Engine::create`] set up before a failing step.
fn unwind(
    callbacks: &mut Callbacks,
    host: &dyn Host,
    log: &Logger,
    device: Option<&Device>,
    adapter: &Adapter,
) {
    if let Some(device) = device {
        if let Err(e) = callbacks.destroy_device(device) {
            warn!(log, "failed to destroy device"; "error" => %e);
        }
    }
    if let Err(e) = callbacks.close_adapter(host, adapter) {
        warn!(log, "failed to close adapter"; "error" => %e);
    }
    callbacks.term();
}

/// View a driver-owned buffer as a slice.
///
/// # Safety
///
/// `ptr` must be null or valid for reads and writes of `len` elements for the
/// lifetime `'a`, with no other live references to that memory.
unsafe fn driver_slice<'a, T>(ptr: *mut T, len: u32) -> &'a mut [T] {
    if ptr.is_null() {
        &mut []
    } else {
        slice::from_raw_parts_mut(ptr, len as usize)
    }
}
