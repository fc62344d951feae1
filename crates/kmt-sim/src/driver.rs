// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::os::raw::c_void;
use std::slice;
use std::sync::{Arc, Mutex};

use kmt_api::*;
use serde::Deserialize;
use strum::EnumCount;
use zerocopy::{FromBytes, IntoBytes};

/// Sizes of the DMA buffers the simulated driver hands out.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Bytes per command buffer
    pub command_buffer_size: u32,
    /// Entries per allocation list
    pub allocation_list_len: u32,
    /// Entries per patch-location list
    pub patch_list_len: u32,
}
impl Default for SimConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 4096,
            allocation_list_len: 32,
            patch_list_len: 32,
        }
    }
}

/// A driver call, as observed by [`SimDriver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    OpenAdapterFromHdc {
        hdc: HDC,
    },
    OpenAdapterFromGdiDisplayName {
        name: String,
    },
    CloseAdapter {
        adapter: D3DKMT_HANDLE,
    },
    CreateDevice {
        adapter: D3DKMT_HANDLE,
    },
    DestroyDevice {
        device: D3DKMT_HANDLE,
    },
    CreateContext {
        device: D3DKMT_HANDLE,
        if_version: u32,
        context_type: u32,
        client_hint: u32,
    },
    DestroyContext {
        context: D3DKMT_HANDLE,
    },
    CreateAllocation {
        device: D3DKMT_HANDLE,
        alloc_type: u32,
        size: u32,
        sync_handle: u64,
        sync_kind: u32,
    },
    DestroyAllocation {
        device: D3DKMT_HANDLE,
        allocations: Vec<D3DKMT_HANDLE>,
    },
    Lock {
        device: D3DKMT_HANDLE,
        allocation: D3DKMT_HANDLE,
        pages: Vec<u32>,
        flags: u32,
    },
    Unlock {
        device: D3DKMT_HANDLE,
        allocations: Vec<D3DKMT_HANDLE>,
    },
    Render {
        context: D3DKMT_HANDLE,
        command: Vec<u8>,
        allocations: Vec<D3DDDI_ALLOCATIONLIST>,
        patches: Vec<D3DDDI_PATCHLOCATIONLIST>,
    },
    EscapeAllocate {
        device: D3DKMT_HANDLE,
        size: u32,
        sync_handle: u64,
        sync_kind: u32,
    },
    EscapeDeallocate {
        device: D3DKMT_HANDLE,
        allocation: u64,
    },
    EscapeSubmit {
        adapter: D3DKMT_HANDLE,
        device: D3DKMT_HANDLE,
        context: D3DKMT_HANDLE,
        entries: Vec<(u64, VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO)>,
    },
    /// Escape with a code the driver does not understand
    Escape {
        code: u32,
    },
}
impl Call {
    pub fn entry(&self) -> EntryPoint {
        match self {
            Call::OpenAdapterFromHdc { .. } => EntryPoint::OpenAdapterFromHdc,
            Call::OpenAdapterFromGdiDisplayName { .. } => {
                EntryPoint::OpenAdapterFromGdiDisplayName
            }
            Call::CloseAdapter { .. } => EntryPoint::CloseAdapter,
            Call::CreateDevice { .. } => EntryPoint::CreateDevice,
            Call::DestroyDevice { .. } => EntryPoint::DestroyDevice,
            Call::CreateContext { .. } => EntryPoint::CreateContext,
            Call::DestroyContext { .. } => EntryPoint::DestroyContext,
            Call::CreateAllocation { .. } => EntryPoint::CreateAllocation,
            Call::DestroyAllocation { .. } => EntryPoint::DestroyAllocation,
            Call::Lock { .. } => EntryPoint::Lock,
            Call::Unlock { .. } => EntryPoint::Unlock,
            Call::Render { .. } => EntryPoint::Render,
            Call::EscapeAllocate { .. }
            | Call::EscapeDeallocate { .. }
            | Call::EscapeSubmit { .. }
            | Call::Escape { .. } => EntryPoint::Escape,
        }
    }
}

/// Split a chromium DMA command into its header and buffer entries.
pub fn chromium_cmd_entries(
    command: &[u8],
) -> Option<(
    VBOXWDDM_DMA_PRIVATEDATA_BASEHDR,
    Vec<VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO>,
)> {
    let (hdr, mut rest) =
        VBOXWDDM_DMA_PRIVATEDATA_BASEHDR::read_from_prefix(command).ok()?;
    let mut entries = Vec::with_capacity(hdr.u32CmdReserved as usize);
    for _ in 0..hdr.u32CmdReserved {
        let (ent, next) =
            VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO::read_from_prefix(rest).ok()?;
        entries.push(ent);
        rest = next;
    }
    Some((hdr, entries))
}

/// Called (outside the driver's own lock) for every successful lock.
pub type LockHook = Arc<dyn Fn(D3DKMT_HANDLE, &[u32]) + Send + Sync>;

/// Driver-owned memory.  Once created it is only accessed through `ptr`, the
/// same pointer handed out to callers.
struct Region<T> {
    ptr: *mut T,
    len: usize,
    _backing: Vec<T>,
}
impl<T: Clone + Default> Region<T> {
    fn new(len: usize) -> Self {
        let mut backing = vec![T::default(); len];
        let ptr = backing.as_mut_ptr();
        Self { ptr, len, _backing: backing }
    }

    fn snapshot(&self, count: usize) -> Vec<T> {
        // Safety: `ptr` covers `len` initialized elements
        unsafe { slice::from_raw_parts(self.ptr, count.min(self.len)) }
            .to_vec()
    }
}

struct DmaGeneration {
    command: Region<u8>,
    allocations: Region<D3DDDI_ALLOCATIONLIST>,
    patches: Region<D3DDDI_PATCHLOCATIONLIST>,
}
impl DmaGeneration {
    fn new(config: &SimConfig) -> Self {
        Self {
            command: Region::new(config.command_buffer_size as usize),
            allocations: Region::new(config.allocation_list_len as usize),
            patches: Region::new(config.patch_list_len as usize),
        }
    }

    fn buffers(&self) -> DmaBuffers {
        DmaBuffers {
            command: self.command.ptr.cast(),
            command_size: self.command.len as u32,
            allocation_list: self.allocations.ptr,
            allocation_list_size: self.allocations.len as u32,
            patch_list: self.patches.ptr,
            patch_list_size: self.patches.len as u32,
        }
    }
}

struct Allocation {
    device: D3DKMT_HANDLE,
    mem: Region<u8>,
}

struct SimState {
    config: SimConfig,
    last_handle: D3DKMT_HANDLE,
    adapters: BTreeMap<D3DKMT_HANDLE, ()>,
    devices: BTreeMap<D3DKMT_HANDLE, D3DKMT_HANDLE>,
    /// Context handle to index of its current DMA generation
    contexts: BTreeMap<D3DKMT_HANDLE, usize>,
    allocations: BTreeMap<D3DKMT_HANDLE, Allocation>,
    /// Every generation ever issued.  Retired ones are kept so that stale
    /// pointers held by a caller remain valid memory.
    generations: Vec<DmaGeneration>,
    calls: Vec<Call>,
    fail: [Option<NTSTATUS>; EntryPoint::COUNT],
    /// Report success without a mapping on the next lock or allocate escape
    unmapped: [bool; EntryPoint::COUNT],
    lock_hook: Option<LockHook>,
}
// Safety: the raw pointers in the state refer to memory owned by the state
// itself, and all access to it goes through the driver mutex.
unsafe impl Send for SimState {}

impl SimState {
    fn handle(&mut self) -> D3DKMT_HANDLE {
        self.last_handle += 1;
        self.last_handle
    }

    fn generation(&mut self) -> usize {
        self.generations.push(DmaGeneration::new(&self.config));
        self.generations.len() - 1
    }

    /// Record `call`, then consume any failure injected for its entry point.
    fn record(&mut self, call: Call) -> Option<NTSTATUS> {
        let entry = call.entry();
        self.calls.push(call);
        self.fail[entry as usize].take()
    }

    fn allocate(&mut self, device: D3DKMT_HANDLE, size: u32) -> D3DKMT_HANDLE {
        let handle = self.handle();
        let mem = Region::new(size as usize);
        self.allocations.insert(handle, Allocation { device, mem });
        handle
    }
}

fn valid_alloc_size(size: u32) -> bool {
    size != 0 && size & PAGE_OFFSET_MASK == 0
}

/// In-process display driver implementing every thunk.
pub struct SimDriver {
    state: Mutex<SimState>,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                config,
                last_handle: 0x40,
                adapters: BTreeMap::new(),
                devices: BTreeMap::new(),
                contexts: BTreeMap::new(),
                allocations: BTreeMap::new(),
                generations: Vec::new(),
                calls: Vec::new(),
                fail: [None; EntryPoint::COUNT],
                unmapped: [false; EntryPoint::COUNT],
                lock_hook: None,
            }),
        })
    }

    /// Fail the next call to `entry` with `status`.
    pub fn fail_next(&self, entry: EntryPoint, status: NTSTATUS) {
        self.state.lock().unwrap().fail[entry as usize] = Some(status);
    }

    /// Let the next mapping call through `entry` succeed with a null
    /// pointer.  Only `Lock` and the allocate escape of `Escape` map memory;
    /// other calls leave the request pending.
    pub fn unmapped_next(&self, entry: EntryPoint) {
        self.state.lock().unwrap().unmapped[entry as usize] = true;
    }

    pub fn set_lock_hook(&self, hook: Option<LockHook>) {
        self.state.lock().unwrap().lock_hook = hook;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, entry: EntryPoint) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|c| c.entry() == entry).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Current contents of an allocation's memory.
    pub fn allocation_bytes(&self, handle: u64) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let handle = D3DKMT_HANDLE::try_from(handle).ok()?;
        let alloc = state.allocations.get(&handle)?;
        Some(alloc.mem.snapshot(alloc.mem.len))
    }

    /// DMA buffers a context is expected to fill for its next render.
    pub fn current_buffers(
        &self,
        context: D3DKMT_HANDLE,
    ) -> Option<DmaBuffers> {
        let state = self.state.lock().unwrap();
        let gen = *state.contexts.get(&context)?;
        Some(state.generations[gen].buffers())
    }

    /// Adapters, devices, contexts and allocations not yet released.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.adapters.len()
            + state.devices.len()
            + state.contexts.len()
            + state.allocations.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    fn escape_allocate(&self, esc: &D3DKMT_ESCAPE, buf: &mut [u8]) -> NTSTATUS {
        let Ok((mut req, _)) =
            VBOXDISPIFESCAPE_UHGSMI_ALLOCATE::read_from_prefix(buf)
        else {
            return STATUS_INVALID_PARAMETER;
        };
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::EscapeAllocate {
            device: esc.hDevice,
            size: req.Alloc.cbData,
            sync_handle: req.Alloc.hSynch,
            sync_kind: req.Alloc.enmSynchType,
        }) {
            return status;
        }
        if !state.devices.contains_key(&esc.hDevice)
            || !valid_alloc_size(req.Alloc.cbData)
        {
            return STATUS_INVALID_PARAMETER;
        }

        let handle = state.allocate(esc.hDevice, req.Alloc.cbData);
        req.Alloc.hAlloc = u64::from(handle);
        req.Alloc.pvData =
            if std::mem::take(&mut state.unmapped[EntryPoint::Escape as usize])
            {
                0
            } else {
                state.allocations[&handle].mem.ptr as u64
            };
        if req.write_to_prefix(buf).is_err() {
            return STATUS_INVALID_PARAMETER;
        }
        STATUS_SUCCESS
    }

    fn escape_deallocate(&self, esc: &D3DKMT_ESCAPE, buf: &[u8]) -> NTSTATUS {
        let Ok((req, _)) =
            VBOXDISPIFESCAPE_UHGSMI_DEALLOCATE::read_from_prefix(buf)
        else {
            return STATUS_INVALID_PARAMETER;
        };
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::EscapeDeallocate {
            device: esc.hDevice,
            allocation: req.hAlloc,
        }) {
            return status;
        }
        let removed = D3DKMT_HANDLE::try_from(req.hAlloc)
            .ok()
            .and_then(|h| state.allocations.remove(&h));
        match removed {
            Some(_) => STATUS_SUCCESS,
            None => STATUS_INVALID_PARAMETER,
        }
    }

    fn escape_submit(
        &self,
        esc: &D3DKMT_ESCAPE,
        hdr: &VBOXDISPIFESCAPE,
        buf: &[u8],
    ) -> NTSTATUS {
        let count = hdr.u32CmdSpecific as usize;
        if buf.len() < uhgsmi_submit_size(count) {
            return STATUS_INVALID_PARAMETER;
        }
        let entry_size = size_of::<VBOXWDDM_UHGSMI_BUFFER_UI_INFO_ESCAPE>();
        let mut entries = Vec::with_capacity(count);
        for chunk in buf[size_of::<VBOXDISPIFESCAPE>()..]
            .chunks_exact(entry_size)
            .take(count)
        {
            let Ok(ent) =
                VBOXWDDM_UHGSMI_BUFFER_UI_INFO_ESCAPE::read_from_bytes(chunk)
            else {
                return STATUS_INVALID_PARAMETER;
            };
            entries.push((ent.hAlloc, ent.Info));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::EscapeSubmit {
            adapter: esc.hAdapter,
            device: esc.hDevice,
            context: esc.hContext,
            entries: entries.clone(),
        }) {
            return status;
        }
        let known = entries.iter().all(|(h, _)| {
            D3DKMT_HANDLE::try_from(*h)
                .map_or(false, |h| state.allocations.contains_key(&h))
        });
        if !known {
            return STATUS_INVALID_PARAMETER;
        }
        STATUS_SUCCESS
    }
}

impl Thunks for SimDriver {
    unsafe fn open_adapter_from_hdc(
        &self,
        data: &mut D3DKMT_OPENADAPTERFROMHDC,
    ) -> NTSTATUS {
        let mut state = self.state.lock().unwrap();
        if let Some(status) =
            state.record(Call::OpenAdapterFromHdc { hdc: data.hDc })
        {
            return status;
        }
        if data.hDc == 0 {
            return STATUS_INVALID_PARAMETER;
        }
        let handle = state.handle();
        state.adapters.insert(handle, ());
        data.hAdapter = handle;
        STATUS_SUCCESS
    }

    unsafe fn open_adapter_from_gdi_display_name(
        &self,
        data: &mut D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME,
    ) -> NTSTATUS {
        let len = data
            .DeviceName
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(data.DeviceName.len());
        let name = String::from_utf16_lossy(&data.DeviceName[..len]);

        let mut state = self.state.lock().unwrap();
        if let Some(status) =
            state.record(Call::OpenAdapterFromGdiDisplayName { name })
        {
            return status;
        }
        let handle = state.handle();
        state.adapters.insert(handle, ());
        data.hAdapter = handle;
        STATUS_SUCCESS
    }

    unsafe fn close_adapter(&self, data: &mut D3DKMT_CLOSEADAPTER) -> NTSTATUS {
        let mut state = self.state.lock().unwrap();
        if let Some(status) =
            state.record(Call::CloseAdapter { adapter: data.hAdapter })
        {
            return status;
        }
        match state.adapters.remove(&data.hAdapter) {
            Some(_) => STATUS_SUCCESS,
            None => STATUS_INVALID_PARAMETER,
        }
    }

    unsafe fn escape(&self, data: &mut D3DKMT_ESCAPE) -> NTSTATUS {
        if data.Type != D3DKMT_ESCAPE_DRIVERPRIVATE
            || data.pPrivateDriverData.is_null()
        {
            return STATUS_INVALID_PARAMETER;
        }
        let buf = slice::from_raw_parts_mut(
            data.pPrivateDriverData.cast::<u8>(),
            data.PrivateDriverDataSize as usize,
        );
        let Ok((hdr, _)) = VBOXDISPIFESCAPE::read_from_prefix(buf) else {
            return STATUS_INVALID_PARAMETER;
        };

        match hdr.escapeCode {
            VBOXESC_UHGSMI_ALLOCATE => self.escape_allocate(data, buf),
            VBOXESC_UHGSMI_DEALLOCATE => self.escape_deallocate(data, buf),
            VBOXESC_UHGSMI_SUBMIT => self.escape_submit(data, &hdr, buf),
            code => {
                let mut state = self.state.lock().unwrap();
                state
                    .record(Call::Escape { code })
                    .unwrap_or(STATUS_NOT_SUPPORTED)
            }
        }
    }

    unsafe fn create_device(&self, data: &mut D3DKMT_CREATEDEVICE) -> NTSTATUS {
        let adapter = data.hAdapter as D3DKMT_HANDLE;
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::CreateDevice { adapter }) {
            return status;
        }
        if !state.adapters.contains_key(&adapter) {
            return STATUS_INVALID_PARAMETER;
        }
        let handle = state.handle();
        state.devices.insert(handle, adapter);
        let gen = state.generation();
        let bufs = state.generations[gen].buffers();

        data.hDevice = handle;
        data.pCommandBuffer = bufs.command;
        data.CommandBufferSize = bufs.command_size;
        data.pAllocationList = bufs.allocation_list;
        data.AllocationListSize = bufs.allocation_list_size;
        data.pPatchLocationList = bufs.patch_list;
        data.PatchLocationListSize = bufs.patch_list_size;
        STATUS_SUCCESS
    }

    unsafe fn destroy_device(
        &self,
        data: &mut D3DKMT_DESTROYDEVICE,
    ) -> NTSTATUS {
        let mut state = self.state.lock().unwrap();
        if let Some(status) =
            state.record(Call::DestroyDevice { device: data.hDevice })
        {
            return status;
        }
        match state.devices.remove(&data.hDevice) {
            Some(_) => STATUS_SUCCESS,
            None => STATUS_INVALID_PARAMETER,
        }
    }

    unsafe fn create_context(
        &self,
        data: &mut D3DKMT_CREATECONTEXT,
    ) -> NTSTATUS {
        if data.pPrivateDriverData.is_null() {
            return STATUS_INVALID_PARAMETER;
        }
        let raw = slice::from_raw_parts(
            data.pPrivateDriverData.cast::<u8>(),
            data.PrivateDriverDataSize as usize,
        );
        let Ok(info) = VBOXWDDM_CREATECONTEXT_INFO::read_from_bytes(raw) else {
            return STATUS_INVALID_PARAMETER;
        };

        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::CreateContext {
            device: data.hDevice,
            if_version: info.u32IfVersion,
            context_type: info.enmType,
            client_hint: data.ClientHint,
        }) {
            return status;
        }
        if !state.devices.contains_key(&data.hDevice)
            || info.u32IfVersion != VBOXWDDM_CONTEXT_IF_VERSION
        {
            return STATUS_INVALID_PARAMETER;
        }
        let handle = state.handle();
        let gen = state.generation();
        state.contexts.insert(handle, gen);
        let bufs = state.generations[gen].buffers();

        data.hContext = handle;
        data.pCommandBuffer = bufs.command;
        data.CommandBufferSize = bufs.command_size;
        data.pAllocationList = bufs.allocation_list;
        data.AllocationListSize = bufs.allocation_list_size;
        data.pPatchLocationList = bufs.patch_list;
        data.PatchLocationListSize = bufs.patch_list_size;
        STATUS_SUCCESS
    }

    unsafe fn destroy_context(
        &self,
        data: &mut D3DKMT_DESTROYCONTEXT,
    ) -> NTSTATUS {
        let mut state = self.state.lock().unwrap();
        if let Some(status) =
            state.record(Call::DestroyContext { context: data.hContext })
        {
            return status;
        }
        match state.contexts.remove(&data.hContext) {
            Some(_) => STATUS_SUCCESS,
            None => STATUS_INVALID_PARAMETER,
        }
    }

    unsafe fn render(&self, data: &mut D3DKMT_RENDER) -> NTSTATUS {
        let mut state = self.state.lock().unwrap();
        let current = state.contexts.get(&data.hContext).copied();

        let call = match current {
            Some(gen) => {
                let g = &state.generations[gen];
                Call::Render {
                    context: data.hContext,
                    command: g.command.snapshot(data.CommandLength as usize),
                    allocations: g
                        .allocations
                        .snapshot(data.AllocationCount as usize),
                    patches: g
                        .patches
                        .snapshot(data.PatchLocationCount as usize),
                }
            }
            None => Call::Render {
                context: data.hContext,
                command: Vec::new(),
                allocations: Vec::new(),
                patches: Vec::new(),
            },
        };
        if let Some(status) = state.record(call) {
            return status;
        }

        let Some(gen) = current else {
            return STATUS_INVALID_PARAMETER;
        };
        let g = &state.generations[gen];
        if data.CommandLength as usize > g.command.len
            || data.AllocationCount as usize > g.allocations.len
            || data.PatchLocationCount as usize > g.patches.len
        {
            return STATUS_INVALID_PARAMETER;
        }

        let next = state.generation();
        state.contexts.insert(data.hContext, next);
        let bufs = state.generations[next].buffers();
        data.pNewCommandBuffer = bufs.command;
        data.NewCommandBufferSize = bufs.command_size;
        data.pNewAllocationList = bufs.allocation_list;
        data.NewAllocationListSize = bufs.allocation_list_size;
        data.pNewPatchLocationList = bufs.patch_list;
        data.NewPatchLocationListSize = bufs.patch_list_size;
        STATUS_SUCCESS
    }

    unsafe fn create_allocation(
        &self,
        data: &mut D3DKMT_CREATEALLOCATION,
    ) -> NTSTATUS {
        if data.NumAllocations != 1 || data.pAllocationInfo.is_null() {
            return STATUS_INVALID_PARAMETER;
        }
        let ai = &mut *data.pAllocationInfo;
        if ai.pPrivateDriverData.is_null() {
            return STATUS_INVALID_PARAMETER;
        }
        let raw = slice::from_raw_parts(
            ai.pPrivateDriverData.cast::<u8>(),
            ai.PrivateDriverDataSize as usize,
        );
        let Ok(info) = VBOXWDDM_ALLOCINFO::read_from_bytes(raw) else {
            return STATUS_INVALID_PARAMETER;
        };

        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::CreateAllocation {
            device: data.hDevice,
            alloc_type: info.enmType,
            size: info.cbBuffer,
            sync_handle: info.hSynch,
            sync_kind: info.enmSynchType,
        }) {
            return status;
        }
        if !state.devices.contains_key(&data.hDevice)
            || info.enmType != VBOXWDDM_ALLOC_TYPE_UMD_HGSMI_BUFFER
            || !valid_alloc_size(info.cbBuffer)
        {
            return STATUS_INVALID_PARAMETER;
        }
        ai.hAllocation = state.allocate(data.hDevice, info.cbBuffer);
        STATUS_SUCCESS
    }

    unsafe fn destroy_allocation(
        &self,
        data: &mut D3DKMT_DESTROYALLOCATION,
    ) -> NTSTATUS {
        let handles = if data.phAllocationList.is_null() {
            Vec::new()
        } else {
            slice::from_raw_parts(
                data.phAllocationList,
                data.AllocationCount as usize,
            )
            .to_vec()
        };
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::DestroyAllocation {
            device: data.hDevice,
            allocations: handles.clone(),
        }) {
            return status;
        }
        let mut status = STATUS_SUCCESS;
        for handle in handles {
            let owned = state
                .allocations
                .get(&handle)
                .map_or(false, |a| a.device == data.hDevice);
            if owned {
                state.allocations.remove(&handle);
            } else {
                status = STATUS_INVALID_PARAMETER;
            }
        }
        status
    }

    unsafe fn lock(&self, data: &mut D3DKMT_LOCK) -> NTSTATUS {
        let pages = if data.NumPages == 0 || data.pPages.is_null() {
            Vec::new()
        } else {
            slice::from_raw_parts(data.pPages, data.NumPages as usize).to_vec()
        };

        let hook = {
            let mut state = self.state.lock().unwrap();
            if let Some(status) = state.record(Call::Lock {
                device: data.hDevice,
                allocation: data.hAllocation,
                pages: pages.clone(),
                flags: data.Flags,
            }) {
                return status;
            }
            let Some(alloc) = state.allocations.get(&data.hAllocation) else {
                return STATUS_INVALID_PARAMETER;
            };
            let npages = alloc.mem.len / PAGE_SIZE as usize;
            if pages.iter().any(|p| *p as usize >= npages) {
                return STATUS_INVALID_PARAMETER;
            }
            let first = match data.Flags & D3DDDICB_LOCKFLAGS_LOCKENTIRE {
                0 => pages.first().copied().unwrap_or(0),
                _ => 0,
            };
            let base = alloc.mem.ptr;
            data.pData = if std::mem::take(
                &mut state.unmapped[EntryPoint::Lock as usize],
            ) {
                std::ptr::null_mut()
            } else {
                base.add(first as usize * PAGE_SIZE as usize).cast::<c_void>()
            };
            state.lock_hook.clone()
        };

        if let Some(hook) = hook {
            hook(data.hAllocation, &pages);
        }
        STATUS_SUCCESS
    }

    unsafe fn unlock(&self, data: &mut D3DKMT_UNLOCK) -> NTSTATUS {
        let handles = if data.phAllocations.is_null() {
            Vec::new()
        } else {
            slice::from_raw_parts(
                data.phAllocations,
                data.NumAllocations as usize,
            )
            .to_vec()
        };
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.record(Call::Unlock {
            device: data.hDevice,
            allocations: handles.clone(),
        }) {
            return status;
        }
        if handles.iter().all(|h| state.allocations.contains_key(h)) {
            STATUS_SUCCESS
        } else {
            STATUS_INVALID_PARAMETER
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_device(drv: &SimDriver) -> (D3DKMT_HANDLE, D3DKMT_CREATEDEVICE) {
        let mut open =
            D3DKMT_OPENADAPTERFROMHDC { hDc: 0x1001, ..Default::default() };
        let mut dev = D3DKMT_CREATEDEVICE::default();
        unsafe {
            assert_eq!(drv.open_adapter_from_hdc(&mut open), STATUS_SUCCESS);
            dev.hAdapter = open.hAdapter as usize;
            assert_eq!(drv.create_device(&mut dev), STATUS_SUCCESS);
        }
        (open.hAdapter, dev)
    }

    #[test]
    fn injected_failure_is_one_shot() {
        let drv = SimDriver::new(SimConfig::default());
        drv.fail_next(EntryPoint::OpenAdapterFromHdc, STATUS_UNSUCCESSFUL);

        let mut open =
            D3DKMT_OPENADAPTERFROMHDC { hDc: 0x1001, ..Default::default() };
        unsafe {
            assert_eq!(
                drv.open_adapter_from_hdc(&mut open),
                STATUS_UNSUCCESSFUL
            );
            assert_eq!(drv.open_adapter_from_hdc(&mut open), STATUS_SUCCESS);
        }
        assert_eq!(drv.call_count(EntryPoint::OpenAdapterFromHdc), 2);
        assert_eq!(drv.live_objects(), 1);
    }

    #[test]
    fn device_gets_buffers() {
        let drv = SimDriver::new(SimConfig {
            command_buffer_size: 256,
            ..Default::default()
        });
        let (_, dev) = open_device(&drv);
        assert!(!dev.pCommandBuffer.is_null());
        assert_eq!(dev.CommandBufferSize, 256);
        assert_eq!(dev.AllocationListSize, 32);
    }

    #[test]
    fn lock_returns_first_page() {
        let drv = SimDriver::new(SimConfig::default());
        let (_, dev) = open_device(&drv);

        let mut info = VBOXWDDM_ALLOCINFO {
            enmType: VBOXWDDM_ALLOC_TYPE_UMD_HGSMI_BUFFER,
            cbBuffer: 3 * PAGE_SIZE,
            ..Default::default()
        };
        let mut ai = D3DDDI_ALLOCATIONINFO {
            pPrivateDriverData: &mut info as *mut _ as *mut c_void,
            PrivateDriverDataSize: size_of::<VBOXWDDM_ALLOCINFO>() as u32,
            ..Default::default()
        };
        let mut create = D3DKMT_CREATEALLOCATION {
            hDevice: dev.hDevice,
            NumAllocations: 1,
            pAllocationInfo: &mut ai,
            ..Default::default()
        };
        unsafe {
            assert_eq!(drv.create_allocation(&mut create), STATUS_SUCCESS);
        }

        let pages = [1u32, 2];
        let mut lock = D3DKMT_LOCK {
            hDevice: dev.hDevice,
            hAllocation: ai.hAllocation,
            NumPages: 2,
            pPages: pages.as_ptr(),
            ..Default::default()
        };
        let mut entire = D3DKMT_LOCK {
            hDevice: dev.hDevice,
            hAllocation: ai.hAllocation,
            Flags: D3DDDICB_LOCKFLAGS_LOCKENTIRE,
            ..Default::default()
        };
        unsafe {
            assert_eq!(drv.lock(&mut lock), STATUS_SUCCESS);
            assert_eq!(drv.lock(&mut entire), STATUS_SUCCESS);
        }
        assert_eq!(
            lock.pData as usize - entire.pData as usize,
            PAGE_SIZE as usize
        );

        // page beyond the end of the allocation
        let bad = [3u32];
        lock.pPages = bad.as_ptr();
        lock.NumPages = 1;
        unsafe {
            assert_eq!(drv.lock(&mut lock), STATUS_INVALID_PARAMETER);
        }
    }

    #[test]
    fn unknown_escape_refused() {
        let drv = SimDriver::new(SimConfig::default());
        let mut hdr =
            VBOXDISPIFESCAPE { escapeCode: 0x1234, u32CmdSpecific: 0 };
        let mut esc = D3DKMT_ESCAPE {
            Type: D3DKMT_ESCAPE_DRIVERPRIVATE,
            pPrivateDriverData: &mut hdr as *mut _ as *mut c_void,
            PrivateDriverDataSize: size_of::<VBOXDISPIFESCAPE>() as u32,
            ..Default::default()
        };
        unsafe {
            assert_eq!(drv.escape(&mut esc), STATUS_NOT_SUPPORTED);
        }
        assert_eq!(drv.calls(), vec![Call::Escape { code: 0x1234 }]);
    }

    #[test]
    fn chromium_cmd_decode() {
        let mut cmd = Vec::new();
        cmd.extend_from_slice(
            VBOXWDDM_DMA_PRIVATEDATA_BASEHDR {
                enmCmd: VBOXVDMACMD_TYPE_CHROMIUM_CMD,
                u32CmdReserved: 1,
            }
            .as_bytes(),
        );
        cmd.extend_from_slice(
            VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO {
                fSubFlags: 0,
                offData: 16,
                cbData: 32,
            }
            .as_bytes(),
        );
        let (hdr, ents) = chromium_cmd_entries(&cmd).unwrap();
        assert_eq!(hdr.enmCmd, VBOXVDMACMD_TYPE_CHROMIUM_CMD);
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].cbData, 32);

        // truncated
        assert!(chromium_cmd_entries(&cmd[..12]).is_none());
    }
}
