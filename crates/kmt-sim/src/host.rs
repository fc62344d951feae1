// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::Mutex;

use kmt_api::{DisplayDevice, Host, HANDLE, HDC};

/// Kind and creation parameters of a handle issued by [`SimHost`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Event { manual_reset: bool, initial_state: bool },
    Semaphore { initial: i32, maximum: i32 },
}

#[derive(Default)]
struct HostState {
    next_handle: HANDLE,
    open: BTreeMap<HANDLE, HandleKind>,
    closed: Vec<HANDLE>,
    live_dcs: Vec<HDC>,
    dcs_created: usize,
    fail_sync: bool,
}

/// In-process stand-in for the OS facilities the engine needs.
pub struct SimHost {
    displays: Vec<DisplayDevice>,
    state: Mutex<HostState>,
}

impl SimHost {
    /// Host with a single primary display, `\\.\DISPLAY1`.
    pub fn new() -> Self {
        Self::with_displays(vec![DisplayDevice {
            name: "\\\\.\\DISPLAY1".to_string(),
            primary: true,
        }])
    }

    pub fn with_displays(displays: Vec<DisplayDevice>) -> Self {
        Self {
            displays,
            state: Mutex::new(HostState {
                next_handle: 0x100,
                ..Default::default()
            }),
        }
    }

    /// Make event and semaphore creation fail until cleared.
    pub fn fail_sync_creation(&self, fail: bool) {
        self.state.lock().unwrap().fail_sync = fail;
    }

    /// Handles created and not yet closed.
    pub fn open_handles(&self) -> Vec<HANDLE> {
        self.state.lock().unwrap().open.keys().copied().collect()
    }

    /// Handles closed so far, in close order.
    pub fn closed_handles(&self) -> Vec<HANDLE> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn handle_kind(&self, handle: HANDLE) -> Option<HandleKind> {
        self.state.lock().unwrap().open.get(&handle).copied()
    }

    pub fn live_dcs(&self) -> usize {
        self.state.lock().unwrap().live_dcs.len()
    }

    pub fn dcs_created(&self) -> usize {
        self.state.lock().unwrap().dcs_created
    }

    fn issue(&self, kind: HandleKind) -> Result<HANDLE> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sync {
            return Err(Error::new(
                ErrorKind::OutOfMemory,
                "sync object creation refused",
            ));
        }
        let handle = state.next_handle;
        state.next_handle += 4;
        state.open.insert(handle, kind);
        Ok(handle)
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SimHost {
    fn enum_display_device(&self, index: u32) -> Option<DisplayDevice> {
        self.displays.get(index as usize).cloned()
    }

    fn create_dc(&self, device_name: &str) -> Result<HDC> {
        if !self.displays.iter().any(|d| d.name == device_name) {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no display {device_name}"),
            ));
        }
        let mut state = self.state.lock().unwrap();
        state.dcs_created += 1;
        let hdc = 0x1000 + state.dcs_created as HDC;
        state.live_dcs.push(hdc);
        Ok(hdc)
    }

    fn release_dc(&self, hdc: HDC) {
        let mut state = self.state.lock().unwrap();
        state.live_dcs.retain(|h| *h != hdc);
    }

    fn create_event(
        &self,
        manual_reset: bool,
        initial_state: bool,
    ) -> Result<HANDLE> {
        self.issue(HandleKind::Event { manual_reset, initial_state })
    }

    fn create_semaphore(&self, initial: i32, maximum: i32) -> Result<HANDLE> {
        self.issue(HandleKind::Semaphore { initial, maximum })
    }

    fn close_handle(&self, handle: HANDLE) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.open.remove(&handle).is_none() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("handle {handle:#x} not open"),
            ));
        }
        state.closed.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handles_tracked() {
        let host = SimHost::new();
        let ev = host.create_event(false, false).unwrap();
        let sem = host.create_semaphore(0, i32::MAX).unwrap();
        assert_ne!(ev, sem);
        assert_eq!(
            host.handle_kind(sem),
            Some(HandleKind::Semaphore { initial: 0, maximum: i32::MAX })
        );

        host.close_handle(ev).unwrap();
        assert_eq!(host.closed_handles(), vec![ev]);
        assert_eq!(host.open_handles(), vec![sem]);

        // double close is refused
        assert!(host.close_handle(ev).is_err());
    }

    #[test]
    fn sync_failure() {
        let host = SimHost::new();
        host.fail_sync_creation(true);
        assert!(host.create_event(false, false).is_err());
        host.fail_sync_creation(false);
        assert!(host.create_event(false, false).is_ok());
    }

    #[test]
    fn dc_lifecycle() {
        let host = SimHost::new();
        assert!(host.create_dc("\\\\.\\DISPLAY9").is_err());
        let dc = host.create_dc("\\\\.\\DISPLAY1").unwrap();
        assert_eq!(host.live_dcs(), 1);
        host.release_dc(dc);
        assert_eq!(host.live_dcs(), 0);
        assert_eq!(host.dcs_created(), 1);
    }
}
