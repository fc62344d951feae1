// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin layer over the display-driver user-mode thunks.
//!
//! Every operation here maps to exactly one driver call (plus whatever OS
//! bookkeeping, such as a display DC, that call requires).  Nothing is
//! retried or buffered: a call either succeeds and hands back a handle, or
//! fails and leaves no state behind.

use std::io;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

pub use kmt_api_sys::*;

mod host;
mod system;

pub use host::{DisplayDevice, Host};
pub use system::{SystemHost, SystemLoader};

/// Module exporting the thunks on the systems we target.
pub const DEFAULT_DRIVER_MODULE: &str = "gdi32.dll";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("display driver not available: {0}")]
    NotAvailable(String),

    #[error("display driver entry point {0} missing")]
    MissingEntryPoint(&'static str),

    #[error("no primary display device")]
    NoPrimaryDisplay,

    #[error("{op} reported device lost ({status:#x})")]
    DeviceLost { op: &'static str, status: NTSTATUS },

    #[error("{op} failed ({status:#x})")]
    Driver { op: &'static str, status: NTSTATUS },

    #[error("host facility failure")]
    Host(#[from] io::Error),
}

/// Translate the status returned by a thunk into a `Result`.
pub fn check_status(op: &'static str, status: NTSTATUS) -> Result<()> {
    match status {
        STATUS_SUCCESS => Ok(()),
        STATUS_DEVICE_REMOVED => Err(Error::DeviceLost { op, status }),
        _ => Err(Error::Driver { op, status }),
    }
}

/// Entry points which must all be exported by the driver module.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumCount, EnumIter, IntoStaticStr,
)]
pub enum EntryPoint {
    #[strum(serialize = "D3DKMTOpenAdapterFromHdc")]
    OpenAdapterFromHdc,
    #[strum(serialize = "D3DKMTOpenAdapterFromGdiDisplayName")]
    OpenAdapterFromGdiDisplayName,
    #[strum(serialize = "D3DKMTCloseAdapter")]
    CloseAdapter,
    #[strum(serialize = "D3DKMTEscape")]
    Escape,
    #[strum(serialize = "D3DKMTCreateDevice")]
    CreateDevice,
    #[strum(serialize = "D3DKMTDestroyDevice")]
    DestroyDevice,
    #[strum(serialize = "D3DKMTCreateContext")]
    CreateContext,
    #[strum(serialize = "D3DKMTDestroyContext")]
    DestroyContext,
    #[strum(serialize = "D3DKMTRender")]
    Render,
    #[strum(serialize = "D3DKMTCreateAllocation")]
    CreateAllocation,
    #[strum(serialize = "D3DKMTDestroyAllocation")]
    DestroyAllocation,
    #[strum(serialize = "D3DKMTLock")]
    Lock,
    #[strum(serialize = "D3DKMTUnlock")]
    Unlock,
}
impl EntryPoint {
    /// Exported symbol name of the entry point.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Addresses of every [`EntryPoint`], as resolved from a [`Module`].
pub struct EntryTable([*const c_void; EntryPoint::COUNT]);
impl EntryTable {
    fn new() -> Self {
        Self([std::ptr::null(); EntryPoint::COUNT])
    }
    fn set(&mut self, entry: EntryPoint, addr: NonNull<c_void>) {
        self.0[entry as usize] = addr.as_ptr();
    }
    pub fn get(&self, entry: EntryPoint) -> *const c_void {
        self.0[entry as usize]
    }
}

/// Loads the module exporting the driver thunks.
pub trait Loader {
    fn load(&self, name: &str) -> io::Result<Box<dyn Module>>;
}

/// A loaded driver module.  Unloaded when dropped.
pub trait Module: Send + Sync {
    /// Look up an exported entry point by name.
    fn resolve(&self, entry: EntryPoint) -> Option<NonNull<c_void>>;

    /// Produce callable thunks from a fully-resolved table.
    ///
    /// # Safety
    ///
    /// Every address in `table` must have been produced by
    /// [`Module::resolve`] on this module, and the returned thunks must not be
    /// used after the module is dropped.
    unsafe fn bind(&self, table: &EntryTable) -> Arc<dyn Thunks>;
}

/// The display-driver thunks, one method per [`EntryPoint`].
///
/// # Safety
///
/// The argument structs carry raw pointers (private driver data, page lists,
/// allocation handle lists) which the driver dereferences.  Callers must
/// ensure that every pointer in the argument is valid for the size the
/// struct advertises for the duration of the call.
#[allow(clippy::missing_safety_doc)]
pub trait Thunks: Send + Sync {
    unsafe fn open_adapter_from_hdc(
        &self,
        data: &mut D3DKMT_OPENADAPTERFROMHDC,
    ) -> NTSTATUS;
    unsafe fn open_adapter_from_gdi_display_name(
        &self,
        data: &mut D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME,
    ) -> NTSTATUS;
    unsafe fn close_adapter(&self, data: &mut D3DKMT_CLOSEADAPTER) -> NTSTATUS;
    unsafe fn escape(&self, data: &mut D3DKMT_ESCAPE) -> NTSTATUS;
    unsafe fn create_device(&self, data: &mut D3DKMT_CREATEDEVICE) -> NTSTATUS;
    unsafe fn destroy_device(&self, data: &mut D3DKMT_DESTROYDEVICE)
        -> NTSTATUS;
    unsafe fn create_context(&self, data: &mut D3DKMT_CREATECONTEXT)
        -> NTSTATUS;
    unsafe fn destroy_context(
        &self,
        data: &mut D3DKMT_DESTROYCONTEXT,
    ) -> NTSTATUS;
    unsafe fn render(&self, data: &mut D3DKMT_RENDER) -> NTSTATUS;
    unsafe fn create_allocation(
        &self,
        data: &mut D3DKMT_CREATEALLOCATION,
    ) -> NTSTATUS;
    unsafe fn destroy_allocation(
        &self,
        data: &mut D3DKMT_DESTROYALLOCATION,
    ) -> NTSTATUS;
    unsafe fn lock(&self, data: &mut D3DKMT_LOCK) -> NTSTATUS;
    unsafe fn unlock(&self, data: &mut D3DKMT_UNLOCK) -> NTSTATUS;
}

/// Client kind of a context, which selects the context type and client hint
/// handed to the driver.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
)]
pub enum ContextKind {
    #[default]
    #[serde(rename = "3d")]
    D3D,
    #[serde(rename = "gl")]
    GL,
}
impl ContextKind {
    pub const fn context_type(self) -> u32 {
        match self {
            ContextKind::D3D => VBOXWDDM_CONTEXT_TYPE_CUSTOM_UHGSMI_3D,
            ContextKind::GL => VBOXWDDM_CONTEXT_TYPE_CUSTOM_UHGSMI_GL,
        }
    }
    pub const fn client_hint(self) -> u32 {
        match self {
            ContextKind::D3D => D3DKMT_CLIENTHINT_DX9,
            ContextKind::GL => D3DKMT_CLIENTHINT_OPENGL,
        }
    }
}

/// Command, allocation-list and patch-list buffers handed out by the driver.
#[derive(Copy, Clone, Debug)]
pub struct DmaBuffers {
    pub command: *mut c_void,
    pub command_size: u32,
    pub allocation_list: *mut D3DDDI_ALLOCATIONLIST,
    pub allocation_list_size: u32,
    pub patch_list: *mut D3DDDI_PATCHLOCATIONLIST,
    pub patch_list_size: u32,
}
// Safety: the buffers belong to the driver and are not tied to the thread
// which happened to receive them.  Access is serialized by their holder.
unsafe impl Send for DmaBuffers {}
unsafe impl Sync for DmaBuffers {}

impl DmaBuffers {
    /// The replacement buffers reported by a successful render.
    pub fn from_render(render: &D3DKMT_RENDER) -> Self {
        Self {
            command: render.pNewCommandBuffer,
            command_size: render.NewCommandBufferSize,
            allocation_list: render.pNewAllocationList,
            allocation_list_size: render.NewAllocationListSize,
            patch_list: render.pNewPatchLocationList,
            patch_list_size: render.NewPatchLocationListSize,
        }
    }
}

#[derive(Debug)]
pub struct Adapter {
    pub handle: D3DKMT_HANDLE,
    /// DC of the display device the adapter was opened from, if any.
    pub hdc: Option<HDC>,
}

#[derive(Debug)]
pub struct Device {
    pub handle: D3DKMT_HANDLE,
    pub buffers: DmaBuffers,
}

#[derive(Debug)]
pub struct Context {
    pub handle: D3DKMT_HANDLE,
    pub kind: ContextKind,
    pub buffers: DmaBuffers,
}
impl Context {
    /// Adopt the buffers the driver supplied in reply to a render.
    pub fn rotate(&mut self, render: &D3DKMT_RENDER) {
        self.buffers = DmaBuffers::from_render(render);
    }
}

struct Resolved {
    // Declared ahead of `module` so the thunks are dropped first.
    thunks: Arc<dyn Thunks>,
    _module: Box<dyn Module>,
    module_name: String,
}

/// The resolved thunk table.
///
/// Starts out empty: every operation fails with [`Error::NotAvailable`] until
/// [`Callbacks::init`] succeeds.
#[derive(Default)]
pub struct Callbacks {
    resolved: Option<Resolved>,
}
impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `module_name` and resolve every [`EntryPoint`] from it.
    ///
    /// Either all entry points are resolved or none are retained: on failure
    /// the module is released again.  Calling this on a table already
    /// initialized from the same module (names compare case-insensitively) is
    /// a no-op; naming a different module fails with [`Error::NotAvailable`]
    /// and leaves the loaded thunks in place.
    pub fn init(
        &mut self,
        loader: &dyn Loader,
        module_name: &str,
    ) -> Result<()> {
        if let Some(r) = self.resolved.as_ref() {
            if r.module_name.eq_ignore_ascii_case(module_name) {
                return Ok(());
            }
            return Err(Error::NotAvailable(format!(
                "{module_name}: thunks already loaded from {}",
                r.module_name
            )));
        }

        let module = loader
            .load(module_name)
            .map_err(|e| Error::NotAvailable(format!("{module_name}: {e}")))?;

        let mut table = EntryTable::new();
        for entry in EntryPoint::iter() {
            match module.resolve(entry) {
                Some(addr) => table.set(entry, addr),
                None => return Err(Error::MissingEntryPoint(entry.name())),
            }
        }

        // Safety: every slot in `table` was resolved from `module`, which is
        // kept alive alongside the thunks.
        let thunks = unsafe { module.bind(&table) };
        self.resolved = Some(Resolved {
            thunks,
            _module: module,
            module_name: module_name.to_string(),
        });
        Ok(())
    }

    /// Release the thunks and the module.  Idempotent.
    pub fn term(&mut self) {
        self.resolved = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn thunks(&self) -> Result<&dyn Thunks> {
        match self.resolved.as_ref() {
            Some(r) => Ok(r.thunks.as_ref()),
            None => {
                Err(Error::NotAvailable("thunks not initialized".to_string()))
            }
        }
    }

    /// Open the adapter driving the primary display device.
    pub fn open_adapter(&self, host: &dyn Host) -> Result<Adapter> {
        let thunks = self.thunks()?;
        let hdc = primary_display_dc(host)?;

        let mut req =
            D3DKMT_OPENADAPTERFROMHDC { hDc: hdc, ..Default::default() };
        // Safety: the request carries no pointers
        let res = check_status("D3DKMTOpenAdapterFromHdc", unsafe {
            thunks.open_adapter_from_hdc(&mut req)
        });
        if let Err(e) = res {
            host.release_dc(hdc);
            return Err(e);
        }
        Ok(Adapter { handle: req.hAdapter, hdc: Some(hdc) })
    }

    /// Open the adapter behind a GDI display name (`\\.\DISPLAY1` and so on).
    ///
    /// A name which does not fit the driver's fixed-size field fails with
    /// [`Error::InvalidArgument`] before the driver is called.
    pub fn open_adapter_from_display_name(
        &self,
        display_name: &str,
    ) -> Result<Adapter> {
        let thunks = self.thunks()?;

        let mut req = D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME::default();
        let name: Vec<u16> = display_name.encode_utf16().collect();
        if name.len() >= GDI_DISPLAY_NAME_LEN {
            return Err(Error::InvalidArgument("display name too long"));
        }
        req.DeviceName[..name.len()].copy_from_slice(&name);

        // Safety: the request carries no pointers
        check_status("D3DKMTOpenAdapterFromGdiDisplayName", unsafe {
            thunks.open_adapter_from_gdi_display_name(&mut req)
        })?;
        Ok(Adapter { handle: req.hAdapter, hdc: None })
    }

    /// Close an adapter.  Its DC is released even if the driver refuses the
    /// close, in which case the driver error is still reported.
    pub fn close_adapter(
        &self,
        host: &dyn Host,
        adapter: &Adapter,
    ) -> Result<()> {
        let thunks = self.thunks()?;
        let mut req = D3DKMT_CLOSEADAPTER { hAdapter: adapter.handle };
        // Safety: the request carries no pointers
        let res = check_status("D3DKMTCloseAdapter", unsafe {
            thunks.close_adapter(&mut req)
        });
        if let Some(hdc) = adapter.hdc {
            host.release_dc(hdc);
        }
        res
    }

    pub fn create_device(&self, adapter: &Adapter) -> Result<Device> {
        let thunks = self.thunks()?;
        let mut req = D3DKMT_CREATEDEVICE {
            hAdapter: adapter.handle as usize,
            ..Default::default()
        };
        // Safety: the request carries no input pointers
        check_status("D3DKMTCreateDevice", unsafe {
            thunks.create_device(&mut req)
        })?;
        Ok(Device {
            handle: req.hDevice,
            buffers: DmaBuffers {
                command: req.pCommandBuffer,
                command_size: req.CommandBufferSize,
                allocation_list: req.pAllocationList,
                allocation_list_size: req.AllocationListSize,
                patch_list: req.pPatchLocationList,
                patch_list_size: req.PatchLocationListSize,
            },
        })
    }

    pub fn destroy_device(&self, device: &Device) -> Result<()> {
        let thunks = self.thunks()?;
        let mut req = D3DKMT_DESTROYDEVICE { hDevice: device.handle };
        // Safety: the request carries no pointers
        check_status("D3DKMTDestroyDevice", unsafe {
            thunks.destroy_device(&mut req)
        })
    }

    pub fn create_context(
        &self,
        device: &Device,
        kind: ContextKind,
    ) -> Result<Context> {
        let thunks = self.thunks()?;
        let mut info = VBOXWDDM_CREATECONTEXT_INFO {
            u32IfVersion: VBOXWDDM_CONTEXT_IF_VERSION,
            enmType: kind.context_type(),
            ..Default::default()
        };
        let mut req = D3DKMT_CREATECONTEXT {
            hDevice: device.handle,
            NodeOrdinal: 0,
            EngineAffinity: 0,
            pPrivateDriverData: &mut info as *mut _ as *mut c_void,
            PrivateDriverDataSize: std::mem::size_of_val(&info) as u32,
            ClientHint: kind.client_hint(),
            ..Default::default()
        };
        // Safety: `pPrivateDriverData` points at `info`, which outlives the
        // call and matches the advertised size.
        check_status("D3DKMTCreateContext", unsafe {
            thunks.create_context(&mut req)
        })?;
        Ok(Context {
            handle: req.hContext,
            kind,
            buffers: DmaBuffers {
                command: req.pCommandBuffer,
                command_size: req.CommandBufferSize,
                allocation_list: req.pAllocationList,
                allocation_list_size: req.AllocationListSize,
                patch_list: req.pPatchLocationList,
                patch_list_size: req.PatchLocationListSize,
            },
        })
    }

    pub fn destroy_context(&self, context: &Context) -> Result<()> {
        let thunks = self.thunks()?;
        let mut req = D3DKMT_DESTROYCONTEXT { hContext: context.handle };
        // Safety: the request carries no pointers
        check_status("D3DKMTDestroyContext", unsafe {
            thunks.destroy_context(&mut req)
        })
    }
}

/// Walk the display devices and create a DC for the primary one.
fn primary_display_dc(host: &dyn Host) -> Result<HDC> {
    for idx in 0u32.. {
        let Some(dev) = host.enum_display_device(idx) else {
            break;
        };
        if dev.primary {
            return Ok(host.create_dc(&dev.name)?);
        }
    }
    Err(Error::NoPrimaryDisplay)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_point_names() {
        assert_eq!(EntryPoint::COUNT, 13);
        assert_eq!(EntryPoint::Lock.name(), "D3DKMTLock");
        assert_eq!(
            EntryPoint::OpenAdapterFromGdiDisplayName.name(),
            "D3DKMTOpenAdapterFromGdiDisplayName"
        );
        assert!(EntryPoint::iter().all(|e| e.name().starts_with("D3DKMT")));
    }

    #[test]
    fn status_translation() {
        assert!(check_status("op", STATUS_SUCCESS).is_ok());
        assert!(matches!(
            check_status("op", STATUS_DEVICE_REMOVED),
            Err(Error::DeviceLost { op: "op", .. })
        ));
        assert!(matches!(
            check_status("op", STATUS_UNSUCCESSFUL),
            Err(Error::Driver { status: STATUS_UNSUCCESSFUL, .. })
        ));
    }

    #[test]
    fn uninitialized_table() {
        let mut cb = Callbacks::new();
        assert!(!cb.is_initialized());
        assert!(matches!(cb.thunks(), Err(Error::NotAvailable(_))));
        // term is fine on an empty table
        cb.term();
        cb.term();
        assert!(matches!(
            cb.open_adapter_from_display_name("\\\\.\\DISPLAY1"),
            Err(Error::NotAvailable(_))
        ));
    }

    #[test]
    fn context_kind_tags() {
        assert_eq!(
            ContextKind::D3D.context_type(),
            VBOXWDDM_CONTEXT_TYPE_CUSTOM_UHGSMI_3D
        );
        assert_eq!(ContextKind::GL.client_hint(), D3DKMT_CLIENTHINT_OPENGL);
        assert_eq!(ContextKind::default(), ContextKind::D3D);
    }
}
