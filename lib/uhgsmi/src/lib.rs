// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-mode HGSMI submission engine.
//!
//! An [`Engine`] owns an adapter, device and context opened through the
//! display-driver thunks.  Clients create [`Buffer`]s in shared video memory,
//! lock them to fill them in, and pass batches of buffer references to
//! [`Engine::submit_async`].  The host signals each buffer's sync object once
//! it is done with the submission.
//!
//! ```text
//! let engine = Engine::create_direct(ContextKind::D3D, &loader, host, &log)?;
//! let buf = engine.buffer_create(8192, SyncKind::Event, None)?;
//! let p = buf.lock(0, 8192, LockFlags::WRITE_ONLY)?;
//! // ... fill in the buffer ...
//! buf.unlock()?;
//! engine.submit_async(&[SubmitEntry::whole(&buf)])?;
//! ```

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod submit;
pub mod sync;

pub use buffer::{Buffer, LockFlags};
pub use config::{EngineConfig, Mode, DEFAULT_ESCAPE_BATCH_LIMIT};
pub use engine::Engine;
pub use error::{Error, Result};
pub use submit::{Extent, SubmitEntry, SubmitFlags};
pub use sync::{check_or_create, SyncKind, SyncObject};

pub use kmt_api::ContextKind;
