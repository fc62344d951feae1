// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encoding of submissions, either as a chromium DMA command (with its
//! allocation and patch-location lists) or as a submit escape.

use std::mem::size_of;

use bitflags::bitflags;
use kmt_api::*;
use zerocopy::IntoBytes;

use crate::buffer::Buffer;
use crate::engine::Engine;
use crate::{Error, Result};

bitflags! {
    /// Per-buffer hints carried with a submission.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// The host only reads the buffer.
        const HOST_READ_ONLY = VBOXUHGSMI_BUFFER_SUBMIT_F_HOSTREADONLY;
        /// The host only writes the buffer.
        const HOST_WRITE_ONLY = VBOXUHGSMI_BUFFER_SUBMIT_F_HOSTWRITEONLY;
        const DO_NOT_RETIRE = VBOXUHGSMI_BUFFER_SUBMIT_F_DONOTRETIRE;
        const ENTIRE_BUFFER = VBOXUHGSMI_BUFFER_SUBMIT_F_ENTIREBUFFER;
        const DO_NOT_SIGNAL_COMPLETION =
            VBOXUHGSMI_BUFFER_SUBMIT_F_DONOTSIGNALCOMPLETION;
    }
}

/// Part of a buffer which is live for a submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Extent {
    Whole,
    Range { off: u32, cb: u32 },
}

/// Reference to a buffer within a submission.
#[derive(Copy, Clone)]
pub struct SubmitEntry<'a, 'e> {
    pub buffer: &'a Buffer<'e>,
    pub extent: Extent,
    pub flags: SubmitFlags,
}
impl<'a, 'e> SubmitEntry<'a, 'e> {
    pub fn whole(buffer: &'a Buffer<'e>) -> Self {
        Self { buffer, extent: Extent::Whole, flags: SubmitFlags::empty() }
    }

    pub fn range(buffer: &'a Buffer<'e>, off: u32, cb: u32) -> Self {
        Self {
            buffer,
            extent: Extent::Range { off, cb },
            flags: SubmitFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: SubmitFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A submission entry reduced to what the driver sees.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub allocation: u64,
    pub info: VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO,
}

/// Check every entry of a batch against `engine` and resolve its extent.
pub(crate) fn resolve(
    engine: &Engine,
    entries: &[SubmitEntry<'_, '_>],
) -> Result<Vec<Resolved>> {
    if entries.is_empty() {
        return Err(Error::InvalidArgument("empty submission"));
    }
    entries
        .iter()
        .map(|ent| {
            if !std::ptr::eq(ent.buffer.engine(), engine) {
                return Err(Error::InvalidArgument(
                    "buffer belongs to another engine",
                ));
            }
            let size = ent.buffer.size();
            let (flags, off, cb) = match ent.extent {
                Extent::Whole => {
                    (ent.flags | SubmitFlags::ENTIRE_BUFFER, 0, size)
                }
                Extent::Range { off, cb } => {
                    match off.checked_add(cb) {
                        Some(end) if end <= size => {}
                        _ => {
                            return Err(Error::InvalidArgument(
                                "submit range exceeds buffer",
                            ))
                        }
                    }
                    (ent.flags - SubmitFlags::ENTIRE_BUFFER, off, cb)
                }
            };
            Ok(Resolved {
                allocation: ent.buffer.token(),
                info: VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO {
                    fSubFlags: flags.bits(),
                    offData: off,
                    cbData: cb,
                },
            })
        })
        .collect()
}

/// Encode `entries` into a context's DMA buffers, returning the length of
/// the command written.
pub(crate) fn dma_fill(
    command: &mut [u8],
    allocations: &mut [D3DDDI_ALLOCATIONLIST],
    patches: &mut [D3DDDI_PATCHLOCATIONLIST],
    entries: &[Resolved],
) -> Result<usize> {
    let count = entries.len();
    let len = chromium_cmd_size(count);
    if command.len() < len {
        return Err(Error::BufferOverflow("command buffer"));
    }
    if allocations.len() < count {
        return Err(Error::BufferOverflow("allocation list"));
    }
    if patches.len() < count {
        return Err(Error::BufferOverflow("patch-location list"));
    }

    let hdr = VBOXWDDM_DMA_PRIVATEDATA_BASEHDR {
        enmCmd: VBOXVDMACMD_TYPE_CHROMIUM_CMD,
        u32CmdReserved: count as u32,
    };
    command[..size_of::<VBOXWDDM_DMA_PRIVATEDATA_BASEHDR>()]
        .copy_from_slice(hdr.as_bytes());

    for (idx, ent) in entries.iter().enumerate() {
        let start = chromium_cmd_size(idx);
        command[start..chromium_cmd_size(idx + 1)]
            .copy_from_slice(ent.info.as_bytes());

        let flags = SubmitFlags::from_bits_retain(ent.info.fSubFlags);
        let mut value = 0;
        if !flags.contains(SubmitFlags::HOST_READ_ONLY) {
            value |= D3DDDI_ALLOCATIONLIST_WRITEOPERATION;
        }
        if flags.contains(SubmitFlags::DO_NOT_RETIRE) {
            value |= D3DDDI_ALLOCATIONLIST_DONOTRETIREINSTANCE;
        }
        allocations[idx] = D3DDDI_ALLOCATIONLIST {
            hAllocation: D3DKMT_HANDLE::try_from(ent.allocation).map_err(
                |_| Error::InvalidArgument("allocation handle out of range"),
            )?,
            Value: value,
        };

        patches[idx] = D3DDDI_PATCHLOCATIONLIST {
            AllocationIndex: idx as u32,
            AllocationOffset: ent.info.offData,
            PatchOffset: chromium_cmd_off_data(idx) as u32,
            ..Default::default()
        };
    }
    Ok(len)
}

/// Build the private data of a `VBOXESC_UHGSMI_SUBMIT` escape.
pub(crate) fn escape_payload(entries: &[Resolved]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(uhgsmi_submit_size(entries.len()));
    let hdr = VBOXDISPIFESCAPE {
        escapeCode: VBOXESC_UHGSMI_SUBMIT,
        u32CmdSpecific: entries.len() as u32,
    };
    payload.extend_from_slice(hdr.as_bytes());
    for ent in entries {
        let wire = VBOXWDDM_UHGSMI_BUFFER_UI_INFO_ESCAPE {
            hAlloc: ent.allocation,
            Info: ent.info,
            _reserved: 0,
        };
        payload.extend_from_slice(wire.as_bytes());
    }
    payload
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::FromBytes;

    fn resolved(
        allocation: u64,
        flags: SubmitFlags,
        off: u32,
        cb: u32,
    ) -> Resolved {
        Resolved {
            allocation,
            info: VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO {
                fSubFlags: flags.bits(),
                offData: off,
                cbData: cb,
            },
        }
    }

    #[test]
    fn dma_fill_layout() {
        let mut cmd = [0u8; 64];
        let mut allocs = [D3DDDI_ALLOCATIONLIST::default(); 4];
        let mut patches = [D3DDDI_PATCHLOCATIONLIST::default(); 4];
        let entries = [
            resolved(0x41, SubmitFlags::ENTIRE_BUFFER, 0, 8192),
            resolved(
                0x42,
                SubmitFlags::HOST_READ_ONLY | SubmitFlags::DO_NOT_RETIRE,
                0x100,
                0x80,
            ),
        ];

        let len =
            dma_fill(&mut cmd, &mut allocs, &mut patches, &entries).unwrap();
        assert_eq!(len, 8 + 2 * 12);

        let (hdr, rest) =
            VBOXWDDM_DMA_PRIVATEDATA_BASEHDR::read_from_prefix(&cmd[..])
                .unwrap();
        assert_eq!(hdr.enmCmd, VBOXVDMACMD_TYPE_CHROMIUM_CMD);
        assert_eq!(hdr.u32CmdReserved, 2);
        let (first, rest) =
            VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO::read_from_prefix(rest).unwrap();
        assert_eq!(first, entries[0].info);
        let (second, _) =
            VBOXWDDM_UHGSMI_BUFFER_SUBMIT_INFO::read_from_prefix(rest).unwrap();
        assert_eq!(second, entries[1].info);

        assert_eq!(
            allocs[0],
            D3DDDI_ALLOCATIONLIST {
                hAllocation: 0x41,
                Value: D3DDDI_ALLOCATIONLIST_WRITEOPERATION,
            }
        );
        assert_eq!(
            allocs[1],
            D3DDDI_ALLOCATIONLIST {
                hAllocation: 0x42,
                Value: D3DDDI_ALLOCATIONLIST_DONOTRETIREINSTANCE,
            }
        );

        assert_eq!(patches[1].AllocationIndex, 1);
        assert_eq!(patches[1].AllocationOffset, 0x100);
        assert_eq!(patches[1].PatchOffset, 8 + 12 + 4);
        // the patch offset lands on the entry's offData field
        let at = patches[1].PatchOffset as usize;
        assert_eq!(&cmd[at..at + 4], &0x100u32.to_ne_bytes());
    }

    #[test]
    fn dma_fill_overflow() {
        let entries = [resolved(1, SubmitFlags::empty(), 0, 4096); 3];
        let mut allocs = [D3DDDI_ALLOCATIONLIST::default(); 3];
        let mut patches = [D3DDDI_PATCHLOCATIONLIST::default(); 3];

        let mut small = [0u8; 16];
        assert!(matches!(
            dma_fill(&mut small, &mut allocs, &mut patches, &entries),
            Err(Error::BufferOverflow("command buffer"))
        ));

        let mut cmd = [0u8; 64];
        assert!(matches!(
            dma_fill(&mut cmd, &mut allocs[..2], &mut patches, &entries),
            Err(Error::BufferOverflow("allocation list"))
        ));
        assert!(matches!(
            dma_fill(&mut cmd, &mut allocs, &mut [], &entries),
            Err(Error::BufferOverflow("patch-location list"))
        ));
    }

    #[test]
    fn dma_fill_rejects_wide_handles() {
        let entries = [resolved(1 << 40, SubmitFlags::empty(), 0, 4096)];
        let mut cmd = [0u8; 64];
        let mut allocs = [D3DDDI_ALLOCATIONLIST::default(); 1];
        let mut patches = [D3DDDI_PATCHLOCATIONLIST::default(); 1];
        assert!(matches!(
            dma_fill(&mut cmd, &mut allocs, &mut patches, &entries),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn escape_payload_layout() {
        let entries = [
            resolved(7, SubmitFlags::empty(), 0, 1024),
            resolved(9, SubmitFlags::ENTIRE_BUFFER, 0, 4096),
        ];
        let payload = escape_payload(&entries);
        assert_eq!(payload.len(), uhgsmi_submit_size(2));

        let (hdr, rest) = VBOXDISPIFESCAPE::read_from_prefix(&payload).unwrap();
        assert_eq!(hdr.escapeCode, VBOXESC_UHGSMI_SUBMIT);
        assert_eq!(hdr.u32CmdSpecific, 2);
        let (ent, _) =
            VBOXWDDM_UHGSMI_BUFFER_UI_INFO_ESCAPE::read_from_prefix(rest)
                .unwrap();
        assert_eq!(ent.hAlloc, 7);
        assert_eq!(ent.Info.cbData, 1024);
    }
}
