// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated display driver and OS host.
//!
//! [`SimDriver`] implements the driver thunks against in-process memory,
//! records every call it receives, and can be told to fail specific calls.
//! [`SimLoader`] hands it out through the module loader seam, and [`SimHost`]
//! stands in for display enumeration and synchronization handles.

mod driver;
mod host;
mod loader;

pub use driver::{chromium_cmd_entries, Call, LockHook, SimConfig, SimDriver};
pub use host::{HandleKind, SimHost};
pub use loader::SimLoader;
