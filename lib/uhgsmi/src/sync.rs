// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization objects signalled by the host when a submission retires.
//!
//! No wait operation is provided: callers wait on the handle with whatever
//! native primitive their platform offers.

use kmt_api::{
    Host, HANDLE, VBOXUHGSMI_SYNCHOBJECT_TYPE_EVENT,
    VBOXUHGSMI_SYNCHOBJECT_TYPE_NONE, VBOXUHGSMI_SYNCHOBJECT_TYPE_SEMAPHORE,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum SyncKind {
    #[default]
    None = VBOXUHGSMI_SYNCHOBJECT_TYPE_NONE,
    Event = VBOXUHGSMI_SYNCHOBJECT_TYPE_EVENT,
    Semaphore = VBOXUHGSMI_SYNCHOBJECT_TYPE_SEMAPHORE,
}
impl SyncKind {
    pub const fn raw(self) -> u32 {
        self as u32
    }
}
impl TryFrom<u32> for SyncKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            VBOXUHGSMI_SYNCHOBJECT_TYPE_NONE => Ok(SyncKind::None),
            VBOXUHGSMI_SYNCHOBJECT_TYPE_EVENT => Ok(SyncKind::Event),
            VBOXUHGSMI_SYNCHOBJECT_TYPE_SEMAPHORE => Ok(SyncKind::Semaphore),
            _ => Err(Error::InvalidArgument("unknown sync object kind")),
        }
    }
}

/// Sync object attached to a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncObject {
    pub kind: SyncKind,
    pub handle: Option<HANDLE>,
    /// Whether the handle was created on the buffer's behalf (and is thus
    /// closed along with it).
    pub created: bool,
}
impl SyncObject {
    /// Handle value as carried in driver private data.
    pub fn raw_handle(&self) -> u64 {
        self.handle.unwrap_or(0) as u64
    }

    /// Close the handle if we own it.
    pub(crate) fn release(&self, host: &dyn Host) -> Result<()> {
        match (self.created, self.handle) {
            (true, Some(handle)) => {
                host.close_handle(handle).map_err(Error::Host)
            }
            _ => Ok(()),
        }
    }
}

/// Validate a caller-supplied sync object, creating one when the kind calls
/// for it and no handle was given.
pub fn check_or_create(
    host: &dyn Host,
    kind: SyncKind,
    handle: Option<HANDLE>,
) -> Result<SyncObject> {
    let created = match (kind, handle) {
        (SyncKind::None, Some(_)) => {
            return Err(Error::InvalidArgument(
                "sync handle given without a sync kind",
            ));
        }
        (SyncKind::None, None) => None,
        (_, Some(_)) => None,
        (SyncKind::Event, None) => {
            // auto-reset, initially unsignalled
            Some(host.create_event(false, false).map_err(Error::Host)?)
        }
        (SyncKind::Semaphore, None) => Some(
            host.create_semaphore(0, i32::MAX).map_err(Error::Host)?,
        ),
    };

    Ok(match created {
        Some(handle) => {
            SyncObject { kind, handle: Some(handle), created: true }
        }
        None => SyncObject { kind, handle, created: false },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use kmt_sim::{HandleKind, SimHost};

    #[test]
    fn none_kind() {
        let host = SimHost::new();
        let obj = check_or_create(&host, SyncKind::None, None).unwrap();
        assert_eq!(obj.handle, None);
        assert!(!obj.created);
        assert_eq!(obj.raw_handle(), 0);

        assert!(matches!(
            check_or_create(&host, SyncKind::None, Some(0x44)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn event_created_unsignalled() {
        let host = SimHost::new();
        let obj = check_or_create(&host, SyncKind::Event, None).unwrap();
        assert!(obj.created);
        let handle = obj.handle.unwrap();
        assert_eq!(
            host.handle_kind(handle),
            Some(HandleKind::Event {
                manual_reset: false,
                initial_state: false
            })
        );

        obj.release(&host).unwrap();
        assert_eq!(host.closed_handles(), vec![handle]);
    }

    #[test]
    fn semaphore_created() {
        let host = SimHost::new();
        let obj = check_or_create(&host, SyncKind::Semaphore, None).unwrap();
        assert_eq!(
            host.handle_kind(obj.handle.unwrap()),
            Some(HandleKind::Semaphore { initial: 0, maximum: i32::MAX })
        );
    }

    #[test]
    fn supplied_handle_not_owned() {
        let host = SimHost::new();
        let mine = host.create_event(true, false).unwrap();
        let obj =
            check_or_create(&host, SyncKind::Event, Some(mine)).unwrap();
        assert_eq!(obj.handle, Some(mine));
        assert!(!obj.created);

        obj.release(&host).unwrap();
        assert!(host.closed_handles().is_empty());
    }

    #[test]
    fn host_failure_surfaces() {
        let host = SimHost::new();
        host.fail_sync_creation(true);
        assert!(matches!(
            check_or_create(&host, SyncKind::Event, None),
            Err(Error::Host(_))
        ));
    }

    #[test]
    fn raw_kinds() {
        assert_eq!(SyncKind::try_from(1).unwrap(), SyncKind::Event);
        assert_eq!(SyncKind::Semaphore.raw(), 2);
        assert!(matches!(
            SyncKind::try_from(7),
            Err(Error::InvalidArgument(_))
        ));
    }
}
