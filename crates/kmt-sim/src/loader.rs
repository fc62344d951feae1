// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kmt_api::{EntryPoint, EntryTable, Loader, Module, Thunks};

use crate::SimDriver;

/// Loader resolving every entry point to a [`SimDriver`].
pub struct SimLoader {
    driver: Arc<SimDriver>,
    available: bool,
    missing: Option<EntryPoint>,
    live: Arc<AtomicUsize>,
    loaded: Mutex<Vec<String>>,
}

impl SimLoader {
    pub fn new(driver: Arc<SimDriver>) -> Self {
        Self {
            driver,
            available: true,
            missing: None,
            live: Arc::new(AtomicUsize::new(0)),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Make every load attempt fail as though the module were absent.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Leave `entry` unexported from the loaded module.
    pub fn without_entry(mut self, entry: EntryPoint) -> Self {
        self.missing = Some(entry);
        self
    }

    pub fn driver(&self) -> &Arc<SimDriver> {
        &self.driver
    }

    /// Number of modules loaded and not yet released.
    pub fn live_modules(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Names passed to every load attempt, in order.
    pub fn load_requests(&self) -> Vec<String> {
        self.loaded.lock().unwrap().clone()
    }
}

impl Loader for SimLoader {
    fn load(&self, name: &str) -> io::Result<Box<dyn Module>> {
        self.loaded.lock().unwrap().push(name.to_string());
        if !self.available {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{name} not present"),
            ));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimModule {
            driver: self.driver.clone(),
            missing: self.missing,
            live: self.live.clone(),
        }))
    }
}

struct SimModule {
    driver: Arc<SimDriver>,
    missing: Option<EntryPoint>,
    live: Arc<AtomicUsize>,
}

impl Module for SimModule {
    fn resolve(&self, entry: EntryPoint) -> Option<NonNull<c_void>> {
        if self.missing == Some(entry) {
            return None;
        }
        // Addresses are never called through: `bind` routes every thunk to
        // the driver object instead.
        Some(NonNull::dangling())
    }

    unsafe fn bind(&self, _table: &EntryTable) -> Arc<dyn Thunks> {
        self.driver.clone()
    }
}

impl Drop for SimModule {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
