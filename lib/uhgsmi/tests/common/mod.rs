// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use std::sync::Arc;

use kmt_api::DisplayDevice;
use kmt_sim::{SimConfig, SimDriver, SimHost, SimLoader};
use slog::{o, Drain, Logger};
use uhgsmi::{Engine, EngineConfig, Mode};

pub fn test_logger() -> Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    Logger::root(drain, o!())
}

/// Simulated driver, loader and host shared by an engine under test.
pub struct Harness {
    pub driver: Arc<SimDriver>,
    pub loader: SimLoader,
    pub host: Arc<SimHost>,
    pub log: Logger,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let driver = SimDriver::new(config);
        Self {
            loader: SimLoader::new(driver.clone()),
            driver,
            host: Arc::new(SimHost::new()),
            log: test_logger(),
        }
    }

    pub fn with_displays(displays: Vec<DisplayDevice>) -> Self {
        let mut h = Self::new();
        h.host = Arc::new(SimHost::with_displays(displays));
        h
    }

    pub fn create(&self, config: EngineConfig) -> uhgsmi::Result<Engine> {
        Engine::create(config, &self.loader, self.host.clone(), &self.log)
    }

    pub fn engine(&self, mode: Mode) -> Engine {
        self.create(EngineConfig { mode, ..Default::default() })
            .expect("engine creation succeeds")
    }
}
