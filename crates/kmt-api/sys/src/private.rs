// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver-private payloads understood by the HGSMI miniport.
//!
//! These travel either as `pPrivateDriverData` of a thunk call or inside the
//! DMA command buffer, so they are plain `#[repr(C)]` structs without
//! implicit padding.

#![allow(non_camel_case_types, non_snake_case)]

use std::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Interface version tag passed along with context creation.
pub const VBOXWDDM_CONTEXT_IF_VERSION: u32 = 9;

// VBOXWDDM_CONTEXT_TYPE
pub const VBOXWDDM_CONTEXT_TYPE_UNDEFINED: u32 = 0;
pub const VBOXWDDM_CONTEXT_TYPE_SYSTEM: u32 = 1;
pub const VBOXWDDM_CONTEXT_TYPE_CUSTOM_3D: u32 = 2;
pub const VBOXWDDM_CONTEXT_TYPE_CUSTOM_2D: u32 = 3;
pub const VBOXWDDM_CONTEXT_TYPE_CUSTOM_UHGSMI_3D: u32 = 4;
pub const VBOXWDDM_CONTEXT_TYPE_CUSTOM_UHGSMI_GL: u32 = 5;

/// Allocation type for buffers created through `D3DKMTCreateAllocation`.
pub const VBOXWDDM_ALLOC_TYPE_UMD_HGSMI_BUFFER: u32 = 6;

// VBOXUHGSMI_SYNCHOBJECT_TYPE
pub const VBOXUHGSMI_SYNCHOBJECT_TYPE_NONE: u32 = 0;
pub const VBOXUHGSMI_SYNCHOBJECT_TYPE_EVENT: u32 = 1;
pub const VBOXUHGSMI_SYNCHOBJECT_TYPE_SEMAPHORE: u32 = 2;

// Escape codes carried in `VBOXDISPIFESCAPE::escapeCode`
pub const VBOXESC_UHGSMI_SUBMIT: u32 = 0xabcd_9006;
pub const VBOXESC_UHGSMI_ALLOCATE: u32 = 0xabcd_9007;
pub const VBOXESC_UHGSMI_DEALLOCATE: u32 = 0xabcd_9008;

/// DMA command type for user-mode HGSMI submissions.
pub const VBOXVDMACMD_TYPE_CHROMIUM_CMD: u32 = 7;

// Per-buffer submit flags (`fSubFlags`)
pub const VBOXUHGSMI_BUFFER_SUBMIT_F_HOSTREADONLY: u32 = 1 << 0;
pub const VBOXUHGSMI_BUFFER_SUBMIT_F_HOSTWRITEONLY: u32 = 1 << 1;
pub const VBOXUHGSMI_BUFFER_SUBMIT_F_DONOTRETIRE: u32 = 1 << 2;
pub const VBOXUHGSMI_BUFFER_SUBMIT_F_ENTIREBUFFER: u32 = 1 << 3;
pub const VBOXUHGSMI_BUFFER_SUBMIT_F_DONOTSIGNALCOMPLETION: u32 = 1 << 4;

/// `pPrivateDriverData` of the single `D3DDDI_ALLOCATIONINFO` passed to
/// `D3DKMTCreateAllocation`.
#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXWDDM_ALLOCINFO {
    pub enmType: u32,
    pub cbBuffer: u32,
    pub hSynch: u64,
    pub enmSynchType: u32,
    pub _reserved: u32,
}

/// `pPrivateDriverData` of `D3DKMTCreateContext`.
#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXWDDM_CREATECONTEXT_INFO {
    pub u32IfVersion: u32,
    pub enmType: u32,
    pub u64UmInfo: u64,
}

/// Common header of every driver-private escape.
#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXDISPIFESCAPE {
    pub escapeCode: u32,
    pub u32CmdSpecific: u32,
}

/// Buffer allocated through the escape path.  `pvData` is the user-space
/// mapping of the whole buffer, filled in by the driver.
#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXVIDEOCM_UM_ALLOC {
    pub hAlloc: u64,
    pub pvData: u64,
    pub hSynch: u64,
    pub cbData: u32,
    pub enmSynchType: u32,
}

#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXDISPIFESCAPE_UHGSMI_ALLOCATE {
    pub EscapeHdr: VBOXDISPIFESCAPE,
    pub Alloc: VBOXVIDEOCM_UM_ALLOC,
}

#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXDISPIFESCAPE_UHGSMI_DEALLOCATE {
    pub EscapeHdr: VBOXDISPIFESCAPE,
    pub hAlloc: u64,
}

/// Live range of one buffer within a submission.
#[repr(C)]
#[derive(
    Copy,
    Clone,
    Default,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
pub struct VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO {
    pub fSubFlags: u32,
    pub offData: u32,
    pub cbData: u32,
}

/// Entry of a `VBOXESC_UHGSMI_SUBMIT` escape.  The escape is a
/// `VBOXDISPIFESCAPE` header (with `u32CmdSpecific` holding the entry count)
/// followed by that many entries.
#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXWDDM_UHGSMI_BUFFER_UI_INFO_ESCAPE {
    pub hAlloc: u64,
    pub Info: VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO,
    pub _reserved: u32,
}

/// Header of the DMA command placed in the context command buffer.  It is
/// followed by `u32CmdReserved` `VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO` entries.
#[repr(C)]
#[derive(
    Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VBOXWDDM_DMA_PRIVATEDATA_BASEHDR {
    pub enmCmd: u32,
    pub u32CmdReserved: u32,
}

/// Byte size of a `VBOXESC_UHGSMI_SUBMIT` escape carrying `count` entries.
pub const fn uhgsmi_submit_size(count: usize) -> usize {
    size_of::<VBOXDISPIFESCAPE>()
        + count * size_of::<VBOXWDDM_UHGSMI_BUFFER_UI_INFO_ESCAPE>()
}

/// Byte size of a chromium DMA command carrying `count` buffer entries.
pub const fn chromium_cmd_size(count: usize) -> usize {
    size_of::<VBOXWDDM_DMA_PRIVATEDATA_BASEHDR>()
        + count * size_of::<VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO>()
}

/// Offset, within a chromium DMA command, of the `offData` field of entry
/// `idx`.  This is where the host patches in the resolved buffer address.
pub const fn chromium_cmd_off_data(idx: usize) -> usize {
    chromium_cmd_size(idx) + size_of::<u32>()
}
