// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared video-memory buffers.
//!
//! A buffer is backed either by a driver allocation which is locked page by
//! page through `D3DKMTLock` (direct mode), or by an escape-allocated region
//! the driver maps once into our address space (escape mode).  Which of the
//! two is built depends on the mode of the owning [`Engine`].

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Mutex;

use bitflags::bitflags;
use kmt_api::*;
use slog::{debug, warn};
use zerocopy::IntoBytes;

use crate::engine::Engine;
use crate::error::refused;
use crate::sync::{SyncKind, SyncObject};
use crate::{Error, Mode, Result};

bitflags! {
    /// Access intent of a [`Buffer::lock`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        const READ_ONLY = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const DONOT_WAIT = 1 << 2;
        const DISCARD = 1 << 3;
        /// Lock the whole buffer, ignoring the requested range.
        const LOCK_ENTIRE = 1 << 4;
    }
}
impl LockFlags {
    /// Equivalent `D3DDDICB_LOCKFLAGS_*` bits.
    pub fn driver_flags(self) -> u32 {
        let mut flags = 0;
        if self.contains(LockFlags::READ_ONLY) {
            flags |= D3DDDICB_LOCKFLAGS_READONLY;
        }
        if self.contains(LockFlags::WRITE_ONLY) {
            flags |= D3DDDICB_LOCKFLAGS_WRITEONLY;
        }
        if self.contains(LockFlags::DONOT_WAIT) {
            flags |= D3DDDICB_LOCKFLAGS_DONOTWAIT;
        }
        if self.contains(LockFlags::DISCARD) {
            flags |= D3DDDICB_LOCKFLAGS_DISCARD;
        }
        if self.contains(LockFlags::LOCK_ENTIRE) {
            flags |= D3DDDICB_LOCKFLAGS_LOCKENTIRE;
        }
        flags
    }
}

/// Validated extent of a lock request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LockRange {
    Entire,
    Bytes { off: u32, cb: u32 },
}
impl LockRange {
    pub(crate) fn new(
        cb_buffer: u32,
        off: u32,
        cb: u32,
        flags: LockFlags,
    ) -> Result<Self> {
        if flags.contains(LockFlags::LOCK_ENTIRE) {
            if off != 0 {
                return Err(Error::InvalidArgument(
                    "entire-buffer lock at non-zero offset",
                ));
            }
            return Ok(LockRange::Entire);
        }
        if cb == 0 {
            return Err(Error::InvalidArgument("zero-length lock"));
        }
        match off.checked_add(cb) {
            Some(end) if end <= cb_buffer => Ok(LockRange::Bytes { off, cb }),
            _ => Err(Error::InvalidArgument("lock range exceeds buffer")),
        }
    }

    /// Offset of the lock within its first page.
    fn page_offset(self) -> usize {
        match self {
            LockRange::Entire => 0,
            LockRange::Bytes { off, .. } => (off & PAGE_OFFSET_MASK) as usize,
        }
    }
}

/// Write the index of every page touched by `[off, off + cb)` into the front
/// of `pages`, returning the number written.
pub(crate) fn fill_pages(pages: &mut [u32], off: u32, cb: u32) -> usize {
    debug_assert!(cb != 0);
    let first = off >> PAGE_SHIFT;
    let last = (off + (cb - 1)) >> PAGE_SHIFT;
    let count = (last - first + 1) as usize;
    for (idx, page) in pages[..count].iter_mut().enumerate() {
        *page = first + idx as u32;
    }
    count
}

/// Round a requested size up to whole pages.
pub(crate) fn round_to_pages(cb: u32) -> Option<u32> {
    cb.checked_add(PAGE_OFFSET_MASK).map(|v| v & !PAGE_OFFSET_MASK)
}

/// Operations which differ between the two buffer kinds.
pub(crate) trait BufferOps {
    fn lock(
        &self,
        engine: &Engine,
        range: LockRange,
        flags: LockFlags,
    ) -> Result<NonNull<u8>>;
    fn unlock(&self, engine: &Engine) -> Result<()>;
    fn release(&self, engine: &Engine) -> Result<()>;
    /// Allocation token the driver knows the buffer by.
    fn token(&self) -> u64;
}

pub(crate) struct DirectBuffer {
    allocation: D3DKMT_HANDLE,
    /// Scratch page-index list handed to `D3DKMTLock`.  Holding its mutex
    /// serializes locks of this buffer.
    pages: Mutex<Box<[u32]>>,
}
impl DirectBuffer {
    fn create(
        engine: &Engine,
        cb_buffer: u32,
        sync: &SyncObject,
    ) -> Result<Self> {
        let npages = (cb_buffer >> PAGE_SHIFT) as usize;
        let mut pages = Vec::new();
        pages.try_reserve_exact(npages).map_err(|_| Error::NoMemory)?;
        pages.resize(npages, 0u32);

        let thunks = engine.callbacks.thunks()?;
        let mut info = VBOXWDDM_ALLOCINFO {
            enmType: VBOXWDDM_ALLOC_TYPE_UMD_HGSMI_BUFFER,
            cbBuffer: cb_buffer,
            hSynch: sync.raw_handle(),
            enmSynchType: sync.kind.raw(),
            ..Default::default()
        };
        let mut alloc_info = D3DDDI_ALLOCATIONINFO {
            pPrivateDriverData: info.as_mut_bytes().as_mut_ptr().cast(),
            PrivateDriverDataSize: size_of::<VBOXWDDM_ALLOCINFO>() as u32,
            ..Default::default()
        };
        let mut req = D3DKMT_CREATEALLOCATION {
            hDevice: engine.device.handle,
            NumAllocations: 1,
            pAllocationInfo: &mut alloc_info,
            ..Default::default()
        };
        // Safety: `pAllocationInfo` and its private data point at locals
        // which outlive the call.
        check_status("D3DKMTCreateAllocation", unsafe {
            thunks.create_allocation(&mut req)
        })
        .map_err(refused)?;

        if alloc_info.hAllocation == 0 {
            return Err(Error::OutOfResources);
        }
        Ok(Self {
            allocation: alloc_info.hAllocation,
            pages: Mutex::new(pages.into_boxed_slice()),
        })
    }
}
impl BufferOps for DirectBuffer {
    fn lock(
        &self,
        engine: &Engine,
        range: LockRange,
        flags: LockFlags,
    ) -> Result<NonNull<u8>> {
        let thunks = engine.callbacks.thunks()?;
        let mut pages = self.pages.lock().unwrap();

        let mut req = D3DKMT_LOCK {
            hDevice: engine.device.handle,
            hAllocation: self.allocation,
            Flags: flags.driver_flags(),
            ..Default::default()
        };
        match range {
            LockRange::Entire => {
                req.Flags |= D3DDDICB_LOCKFLAGS_LOCKENTIRE;
            }
            LockRange::Bytes { off, cb } => {
                req.NumPages = fill_pages(&mut pages, off, cb) as u32;
                req.pPages = pages.as_ptr();
            }
        }
        // Safety: `pPages` points into the page list, which stays locked
        // (and so unmodified) until after the call returns.
        check_status("D3DKMTLock", unsafe { thunks.lock(&mut req) })?;

        if req.pData.is_null() {
            if let Err(e) = self.unlock(engine) {
                warn!(engine.log, "failed to unlock unmapped buffer";
                    "allocation" => self.allocation, "error" => %e);
            }
            return Err(Error::OutOfResources);
        }
        let data = req.pData.cast::<u8>();
        NonNull::new(data.wrapping_add(range.page_offset()))
            .ok_or(Error::OutOfResources)
    }

    fn unlock(&self, engine: &Engine) -> Result<()> {
        let thunks = engine.callbacks.thunks()?;
        let mut req = D3DKMT_UNLOCK {
            hDevice: engine.device.handle,
            NumAllocations: 1,
            phAllocations: &self.allocation,
        };
        // Safety: `phAllocations` points at a single handle owned by `self`
        check_status("D3DKMTUnlock", unsafe { thunks.unlock(&mut req) })?;
        Ok(())
    }

    fn release(&self, engine: &Engine) -> Result<()> {
        let thunks = engine.callbacks.thunks()?;
        let mut req = D3DKMT_DESTROYALLOCATION {
            hDevice: engine.device.handle,
            hResource: 0,
            phAllocationList: &self.allocation,
            AllocationCount: 1,
        };
        // Safety: `phAllocationList` points at a single handle owned by `self`
        check_status("D3DKMTDestroyAllocation", unsafe {
            thunks.destroy_allocation(&mut req)
        })?;
        Ok(())
    }

    fn token(&self) -> u64 {
        u64::from(self.allocation)
    }
}

pub(crate) struct EscapeBuffer {
    allocation: u64,
    /// Driver mapping of the whole buffer
    data: NonNull<u8>,
}
// Safety: `data` is a mapping owned by the driver for the life of the
// allocation; the buffer itself never dereferences it.
unsafe impl Send for EscapeBuffer {}
unsafe impl Sync for EscapeBuffer {}

impl EscapeBuffer {
    fn create(
        engine: &Engine,
        cb_buffer: u32,
        sync: &SyncObject,
    ) -> Result<Self> {
        let mut req = VBOXDISPIFESCAPE_UHGSMI_ALLOCATE {
            EscapeHdr: VBOXDISPIFESCAPE {
                escapeCode: VBOXESC_UHGSMI_ALLOCATE,
                u32CmdSpecific: 0,
            },
            Alloc: VBOXVIDEOCM_UM_ALLOC {
                cbData: cb_buffer,
                hSynch: sync.raw_handle(),
                enmSynchType: sync.kind.raw(),
                ..Default::default()
            },
        };
        engine.escape(req.as_mut_bytes()).map_err(refused)?;

        let allocation = req.Alloc.hAlloc;
        match NonNull::new(req.Alloc.pvData as usize as *mut u8) {
            Some(data) if allocation != 0 => Ok(Self { allocation, data }),
            _ => {
                if allocation != 0 {
                    let partial = EscapeBuffer {
                        allocation,
                        data: NonNull::dangling(),
                    };
                    if let Err(e) = partial.release(engine) {
                        warn!(engine.log, "failed to release unmapped buffer";
                            "allocation" => allocation, "error" => %e);
                    }
                }
                Err(Error::OutOfResources)
            }
        }
    }
}
impl BufferOps for EscapeBuffer {
    fn lock(
        &self,
        _engine: &Engine,
        range: LockRange,
        _flags: LockFlags,
    ) -> Result<NonNull<u8>> {
        let off = match range {
            LockRange::Entire => 0,
            LockRange::Bytes { off, .. } => off as usize,
        };
        NonNull::new(self.data.as_ptr().wrapping_add(off))
            .ok_or(Error::OutOfResources)
    }

    fn unlock(&self, _engine: &Engine) -> Result<()> {
        Ok(())
    }

    fn release(&self, engine: &Engine) -> Result<()> {
        let mut req = VBOXDISPIFESCAPE_UHGSMI_DEALLOCATE {
            EscapeHdr: VBOXDISPIFESCAPE {
                escapeCode: VBOXESC_UHGSMI_DEALLOCATE,
                u32CmdSpecific: 0,
            },
            hAlloc: self.allocation,
        };
        engine.escape(req.as_mut_bytes())?;
        Ok(())
    }

    fn token(&self) -> u64 {
        self.allocation
    }
}

pub(crate) enum BufferImpl {
    Direct(DirectBuffer),
    Escape(EscapeBuffer),
}
impl BufferImpl {
    fn ops(&self) -> &dyn BufferOps {
        match self {
            BufferImpl::Direct(b) => b,
            BufferImpl::Escape(b) => b,
        }
    }
}

/// A buffer in shared video memory, owned by an [`Engine`].
pub struct Buffer<'e> {
    engine: &'e Engine,
    cb_buffer: u32,
    sync: SyncObject,
    inner: BufferImpl,
    released: bool,
}

impl<'e> Buffer<'e> {
    pub(crate) fn create(
        engine: &'e Engine,
        cb: u32,
        kind: SyncKind,
        handle: Option<HANDLE>,
    ) -> Result<Self> {
        if cb == 0 {
            return Err(Error::InvalidArgument("zero-sized buffer"));
        }
        let sync = crate::sync::check_or_create(engine.host(), kind, handle)?;

        let inner = round_to_pages(cb)
            .ok_or(Error::InvalidArgument("buffer size overflows"))
            .and_then(|cb_buffer| {
                let inner = match engine.mode() {
                    Mode::Direct => BufferImpl::Direct(DirectBuffer::create(
                        engine, cb_buffer, &sync,
                    )?),
                    Mode::Escape => BufferImpl::Escape(EscapeBuffer::create(
                        engine, cb_buffer, &sync,
                    )?),
                };
                Ok((cb_buffer, inner))
            });
        let (cb_buffer, inner) = match inner {
            Ok(v) => v,
            Err(e) => {
                if let Err(ce) = sync.release(engine.host()) {
                    warn!(engine.log, "failed to close sync object";
                        "error" => %ce);
                }
                return Err(e);
            }
        };

        debug!(engine.log, "buffer created";
            "size" => cb_buffer,
            "token" => inner.ops().token(),
            "sync" => ?sync.kind);
        Ok(Self { engine, cb_buffer, sync, inner, released: false })
    }

    /// Map `[off, off + cb)` of the buffer, returning a pointer to byte `off`.
    ///
    /// The pointer is valid for `cb` bytes (or the whole buffer when locked
    /// with [`LockFlags::LOCK_ENTIRE`]) until the matching [`Buffer::unlock`].
    pub fn lock(
        &self,
        off: u32,
        cb: u32,
        flags: LockFlags,
    ) -> Result<NonNull<u8>> {
        let range = LockRange::new(self.cb_buffer, off, cb, flags)?;
        self.inner.ops().lock(self.engine, range, flags)
    }

    pub fn unlock(&self) -> Result<()> {
        self.inner.ops().unlock(self.engine)
    }

    /// Release the allocation, and the sync object if it was created along
    /// with the buffer.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let res = self.inner.ops().release(self.engine);
        if let Err(e) = &res {
            warn!(self.engine.log, "failed to release buffer allocation";
                "token" => self.token(), "error" => %e);
        }
        // The sync object goes regardless of what the driver said.
        if let Err(e) = self.sync.release(self.engine.host()) {
            warn!(self.engine.log, "failed to close sync object";
                "token" => self.token(), "error" => %e);
            return res.and(Err(e));
        }
        res
    }

    /// Size in bytes, rounded up to whole pages.
    pub fn size(&self) -> u32 {
        self.cb_buffer
    }

    pub fn sync(&self) -> &SyncObject {
        &self.sync
    }

    pub fn token(&self) -> u64 {
        self.inner.ops().token()
    }

    pub(crate) fn engine(&self) -> &'e Engine {
        self.engine
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        // Failures are already logged by release()
        let _ = self.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(round_to_pages(1), Some(PAGE_SIZE));
        assert_eq!(round_to_pages(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(round_to_pages(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(round_to_pages(u32::MAX), None);
    }

    #[test]
    fn pages_touched() {
        let mut pages = [u32::MAX; 4];
        assert_eq!(fill_pages(&mut pages, 0, 4096), 1);
        assert_eq!(pages[0], 0);

        assert_eq!(fill_pages(&mut pages, 4095, 2), 2);
        assert_eq!(&pages[..2], &[0, 1]);

        assert_eq!(fill_pages(&mut pages, 0x1800, 0x2000), 3);
        assert_eq!(&pages[..3], &[1, 2, 3]);

        assert_eq!(fill_pages(&mut pages, 0x3fff, 1), 1);
        assert_eq!(pages[0], 3);
    }

    #[test]
    fn lock_range_validation() {
        let cb = 2 * PAGE_SIZE;
        assert_eq!(
            LockRange::new(cb, 16, 32, LockFlags::empty()).unwrap(),
            LockRange::Bytes { off: 16, cb: 32 }
        );
        assert_eq!(
            LockRange::new(cb, 0, 0, LockFlags::LOCK_ENTIRE).unwrap(),
            LockRange::Entire
        );
        for (off, len, flags) in [
            (0, 0, LockFlags::empty()),
            (cb - 4, 8, LockFlags::empty()),
            (u32::MAX, 2, LockFlags::WRITE_ONLY),
            (4, 4, LockFlags::LOCK_ENTIRE),
        ] {
            assert!(matches!(
                LockRange::new(cb, off, len, flags),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn page_offset_of_range() {
        let r = LockRange::Bytes { off: 0x2010, cb: 4 };
        assert_eq!(r.page_offset(), 0x10);
        assert_eq!(LockRange::Entire.page_offset(), 0);
    }

    #[test]
    fn driver_lock_flags() {
        assert_eq!(LockFlags::empty().driver_flags(), 0);
        assert_eq!(
            (LockFlags::READ_ONLY | LockFlags::DISCARD).driver_flags(),
            D3DDDICB_LOCKFLAGS_READONLY | D3DDDICB_LOCKFLAGS_DISCARD
        );
        assert_eq!(
            LockFlags::LOCK_ENTIRE.driver_flags(),
            D3DDDICB_LOCKFLAGS_LOCKENTIRE
        );
    }
}
