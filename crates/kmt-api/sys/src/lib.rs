// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw definitions for the display-driver user-mode thunks and the private
//! payloads exchanged with the HGSMI miniport.

mod private;
mod structs;

pub use private::*;
pub use structs::*;

pub type NTSTATUS = i32;
pub type D3DKMT_HANDLE = u32;
pub type HANDLE = isize;
pub type HDC = isize;

pub const STATUS_SUCCESS: NTSTATUS = 0;
pub const STATUS_UNSUCCESSFUL: NTSTATUS = 0xc000_0001_u32 as i32;
pub const STATUS_INVALID_PARAMETER: NTSTATUS = 0xc000_000d_u32 as i32;
pub const STATUS_NO_MEMORY: NTSTATUS = 0xc000_0017_u32 as i32;
pub const STATUS_NOT_SUPPORTED: NTSTATUS = 0xc000_00bb_u32 as i32;
pub const STATUS_DEVICE_REMOVED: NTSTATUS = 0xc000_02b6_u32 as i32;

/// Size of the pages addressed by `D3DKMT_LOCK::pPages`.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

pub const D3DKMT_ESCAPE_DRIVERPRIVATE: u32 = 0;

pub const D3DKMT_CLIENTHINT_UNKNOWN: u32 = 0;
pub const D3DKMT_CLIENTHINT_OPENGL: u32 = 1;
pub const D3DKMT_CLIENTHINT_DX9: u32 = 9;

pub const D3DDDI_MAX_BROADCAST_CONTEXT: usize = 64;

// D3DDDI_ALLOCATIONLIST flag bits
pub const D3DDDI_ALLOCATIONLIST_WRITEOPERATION: u32 = 1 << 0;
pub const D3DDDI_ALLOCATIONLIST_DONOTRETIREINSTANCE: u32 = 1 << 1;

// D3DDDICB_LOCKFLAGS bits
pub const D3DDDICB_LOCKFLAGS_READONLY: u32 = 1 << 0;
pub const D3DDDICB_LOCKFLAGS_WRITEONLY: u32 = 1 << 1;
pub const D3DDDICB_LOCKFLAGS_DONOTWAIT: u32 = 1 << 2;
pub const D3DDDICB_LOCKFLAGS_IGNORESYNC: u32 = 1 << 3;
pub const D3DDDICB_LOCKFLAGS_LOCKENTIRE: u32 = 1 << 4;
pub const D3DDDICB_LOCKFLAGS_DONOTEVICT: u32 = 1 << 5;
pub const D3DDDICB_LOCKFLAGS_ACQUIREAPERTURE: u32 = 1 << 6;
pub const D3DDDICB_LOCKFLAGS_DISCARD: u32 = 1 << 7;
