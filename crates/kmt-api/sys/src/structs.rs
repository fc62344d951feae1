// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(non_camel_case_types, non_snake_case)]

use std::os::raw::c_void;

use super::{D3DKMT_HANDLE, D3DDDI_MAX_BROADCAST_CONTEXT, HANDLE, HDC};

/// Implement `Default` as the all-zero value for argument structs which carry
/// raw pointers (and thus cannot derive it).
macro_rules! zeroed_default {
    ($($t:ty),* $(,)?) => {
        $(
            impl Default for $t {
                fn default() -> Self {
                    // Safety: every field is an integer, an array of
                    // integers, or a raw pointer, all of which are valid
                    // when zeroed.
                    unsafe { std::mem::zeroed() }
                }
            }
        )*
    };
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct LUID {
    pub LowPart: u32,
    pub HighPart: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct D3DDDI_ALLOCATIONLIST {
    pub hAllocation: D3DKMT_HANDLE,
    /// `D3DDDI_ALLOCATIONLIST_*` flag bits
    pub Value: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct D3DDDI_PATCHLOCATIONLIST {
    pub AllocationIndex: u32,
    pub Value: u32,
    pub DriverId: u32,
    pub AllocationOffset: u32,
    pub PatchOffset: u32,
    pub SplitOffset: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_OPENADAPTERFROMHDC {
    pub hDc: HDC,
    pub hAdapter: D3DKMT_HANDLE,
    pub AdapterLuid: LUID,
    pub VidPnSourceId: u32,
}

pub const GDI_DISPLAY_NAME_LEN: usize = 32;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME {
    pub DeviceName: [u16; GDI_DISPLAY_NAME_LEN],
    pub hAdapter: D3DKMT_HANDLE,
    pub AdapterLuid: LUID,
    pub VidPnSourceId: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct D3DKMT_CLOSEADAPTER {
    pub hAdapter: D3DKMT_HANDLE,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_CREATEDEVICE {
    /// Union of `hAdapter` and `pAdapter` in the C definition; only the handle
    /// form is used here, widened to pointer size.
    pub hAdapter: usize,
    pub Flags: u32,
    pub hDevice: D3DKMT_HANDLE,
    pub pCommandBuffer: *mut c_void,
    pub CommandBufferSize: u32,
    pub pAllocationList: *mut D3DDDI_ALLOCATIONLIST,
    pub AllocationListSize: u32,
    pub pPatchLocationList: *mut D3DDDI_PATCHLOCATIONLIST,
    pub PatchLocationListSize: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct D3DKMT_DESTROYDEVICE {
    pub hDevice: D3DKMT_HANDLE,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_CREATECONTEXT {
    pub hDevice: D3DKMT_HANDLE,
    pub NodeOrdinal: u32,
    pub EngineAffinity: u32,
    pub Flags: u32,
    pub pPrivateDriverData: *mut c_void,
    pub PrivateDriverDataSize: u32,
    pub ClientHint: u32,
    pub hContext: D3DKMT_HANDLE,
    pub pCommandBuffer: *mut c_void,
    pub CommandBufferSize: u32,
    pub pAllocationList: *mut D3DDDI_ALLOCATIONLIST,
    pub AllocationListSize: u32,
    pub pPatchLocationList: *mut D3DDDI_PATCHLOCATIONLIST,
    pub PatchLocationListSize: u32,
    pub CommandBuffer: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct D3DKMT_DESTROYCONTEXT {
    pub hContext: D3DKMT_HANDLE,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_RENDER {
    /// Union of `hDevice` and `hContext`; the context form is always used.
    pub hContext: D3DKMT_HANDLE,
    pub CommandOffset: u32,
    pub CommandLength: u32,
    pub AllocationCount: u32,
    pub PatchLocationCount: u32,
    pub pNewCommandBuffer: *mut c_void,
    pub NewCommandBufferSize: u32,
    pub pNewAllocationList: *mut D3DDDI_ALLOCATIONLIST,
    pub NewAllocationListSize: u32,
    pub pNewPatchLocationList: *mut D3DDDI_PATCHLOCATIONLIST,
    pub NewPatchLocationListSize: u32,
    pub Flags: u32,
    pub PresentHistoryToken: u64,
    pub BroadcastContextCount: u32,
    pub BroadcastContext: [D3DKMT_HANDLE; D3DDDI_MAX_BROADCAST_CONTEXT],
    pub QueuedBufferCount: u32,
    pub NewCommandBuffer: u64,
    pub pPrivateDriverData: *mut c_void,
    pub PrivateDriverDataSize: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DDDI_ALLOCATIONINFO {
    pub hAllocation: D3DKMT_HANDLE,
    pub pSystemMem: *const c_void,
    pub pPrivateDriverData: *mut c_void,
    pub PrivateDriverDataSize: u32,
    pub VidPnSourceId: u32,
    pub Flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_CREATEALLOCATION {
    pub hDevice: D3DKMT_HANDLE,
    pub hResource: D3DKMT_HANDLE,
    pub hGlobalShare: D3DKMT_HANDLE,
    pub pPrivateRuntimeData: *const c_void,
    pub PrivateRuntimeDataSize: u32,
    pub pPrivateDriverData: *const c_void,
    pub PrivateDriverDataSize: u32,
    pub NumAllocations: u32,
    pub pAllocationInfo: *mut D3DDDI_ALLOCATIONINFO,
    pub Flags: u32,
    pub hPrivateRuntimeResourceHandle: HANDLE,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_DESTROYALLOCATION {
    pub hDevice: D3DKMT_HANDLE,
    pub hResource: D3DKMT_HANDLE,
    pub phAllocationList: *const D3DKMT_HANDLE,
    pub AllocationCount: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_LOCK {
    pub hDevice: D3DKMT_HANDLE,
    pub hAllocation: D3DKMT_HANDLE,
    pub PrivateDriverData: u32,
    pub NumPages: u32,
    pub pPages: *const u32,
    pub pData: *mut c_void,
    /// `D3DDDICB_LOCKFLAGS_*` bits
    pub Flags: u32,
    pub GpuVirtualAddress: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_UNLOCK {
    pub hDevice: D3DKMT_HANDLE,
    pub NumAllocations: u32,
    pub phAllocations: *const D3DKMT_HANDLE,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct D3DKMT_ESCAPE {
    pub hAdapter: D3DKMT_HANDLE,
    pub hDevice: D3DKMT_HANDLE,
    pub Type: u32,
    pub Flags: u32,
    pub pPrivateDriverData: *mut c_void,
    pub PrivateDriverDataSize: u32,
    pub hContext: D3DKMT_HANDLE,
}

zeroed_default!(
    D3DKMT_OPENADAPTERFROMHDC,
    D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME,
    D3DKMT_CREATEDEVICE,
    D3DKMT_CREATECONTEXT,
    D3DKMT_RENDER,
    D3DDDI_ALLOCATIONINFO,
    D3DKMT_CREATEALLOCATION,
    D3DKMT_DESTROYALLOCATION,
    D3DKMT_LOCK,
    D3DKMT_UNLOCK,
    D3DKMT_ESCAPE,
);
