// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Result;

use kmt_api_sys::{HANDLE, HDC};

/// Display device as reported by the host's enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayDevice {
    pub name: String,
    pub primary: bool,
}

/// OS facilities used alongside the driver thunks.
pub trait Host: Send + Sync {
    /// Display device at `index`, or `None` once enumeration is exhausted.
    fn enum_display_device(&self, index: u32) -> Option<DisplayDevice>;

    fn create_dc(&self, device_name: &str) -> Result<HDC>;
    fn release_dc(&self, hdc: HDC);

    fn create_event(
        &self,
        manual_reset: bool,
        initial_state: bool,
    ) -> Result<HANDLE>;
    fn create_semaphore(&self, initial: i32, maximum: i32) -> Result<HANDLE>;

    fn close_handle(&self, handle: HANDLE) -> Result<()>;
}
