// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use kmt_api::NTSTATUS;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory")]
    NoMemory,

    #[error("driver refused to allocate resources")]
    OutOfResources,

    #[error("display driver not available: {0}")]
    NotAvailable(String),

    #[error("display driver entry point {0} missing")]
    MissingEntryPoint(&'static str),

    #[error("no primary display device")]
    NoPrimaryDisplay,

    #[error("{op} reported device lost ({status:#x})")]
    DeviceLost { op: &'static str, status: NTSTATUS },

    #[error("{op} failed ({status:#x})")]
    General { op: &'static str, status: NTSTATUS },

    #[error("{0} too small for submission")]
    BufferOverflow(&'static str),

    #[error("host facility failure")]
    Host(#[source] io::Error),
}

impl From<kmt_api::Error> for Error {
    fn from(value: kmt_api::Error) -> Self {
        match value {
            kmt_api::Error::InvalidArgument(s) => Error::InvalidArgument(s),
            kmt_api::Error::NotAvailable(s) => Error::NotAvailable(s),
            kmt_api::Error::MissingEntryPoint(name) => {
                Error::MissingEntryPoint(name)
            }
            kmt_api::Error::NoPrimaryDisplay => Error::NoPrimaryDisplay,
            kmt_api::Error::DeviceLost { op, status } => {
                Error::DeviceLost { op, status }
            }
            kmt_api::Error::Driver { op, status } => {
                Error::General { op, status }
            }
            kmt_api::Error::Host(e) => Error::Host(e),
        }
    }
}

/// Translation for driver calls which hand out resources: a plain refusal
/// means the driver is out of them.  Device loss is still reported as such.
pub(crate) fn refused(value: kmt_api::Error) -> Error {
    match value {
        kmt_api::Error::Driver { .. } => Error::OutOfResources,
        other => other.into(),
    }
}
