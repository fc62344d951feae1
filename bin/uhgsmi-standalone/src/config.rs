// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use anyhow::Context;
use kmt_sim::SimConfig;
use serde::Deserialize;
use uhgsmi::{EngineConfig, SubmitFlags, SyncKind};

/// A scripted run: the engine to open, the buffers to create in it, and the
/// submissions to make, in order.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default, rename = "buffer")]
    pub buffers: BTreeMap<String, BufferConfig>,

    #[serde(default, rename = "submit")]
    pub submits: Vec<SubmitStep>,

    /// Shape of the simulated driver, when running against it
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    pub size: u32,
    #[serde(default)]
    pub sync: SyncKind,
    /// Byte to fill the buffer with before the first submission
    pub fill: Option<u8>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitStep {
    pub buffers: Vec<SubmitRef>,
}

/// Reference to a named buffer within a submit step.
///
/// Without `off` or `cb` the whole buffer is submitted.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRef {
    pub name: String,
    pub off: Option<u32>,
    pub cb: Option<u32>,
    #[serde(default)]
    pub flags: Vec<SubmitFlag>,
}

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitFlag {
    HostReadOnly,
    HostWriteOnly,
    DoNotRetire,
    DoNotSignalCompletion,
}

impl SubmitRef {
    pub fn flags(&self) -> SubmitFlags {
        self.flags.iter().fold(SubmitFlags::empty(), |acc, f| {
            acc | match f {
                SubmitFlag::HostReadOnly => SubmitFlags::HOST_READ_ONLY,
                SubmitFlag::HostWriteOnly => SubmitFlags::HOST_WRITE_ONLY,
                SubmitFlag::DoNotRetire => SubmitFlags::DO_NOT_RETIRE,
                SubmitFlag::DoNotSignalCompletion => {
                    SubmitFlags::DO_NOT_SIGNAL_COMPLETION
                }
            }
        })
    }

    /// Byte range to submit, or `None` for the whole buffer.
    pub fn range(&self, buffer_size: u32) -> Option<(u32, u32)> {
        match (self.off, self.cb) {
            (None, None) => None,
            (off, cb) => {
                let off = off.unwrap_or(0);
                Some((off, cb.unwrap_or(buffer_size.saturating_sub(off))))
            }
        }
    }
}

impl Config {
    /// Names referenced by submit steps which have no `[buffer]` table.
    pub fn undefined_buffers(&self) -> Vec<&str> {
        self.submits
            .iter()
            .flat_map(|step| step.buffers.iter())
            .filter(|r| !self.buffers.contains_key(&r.name))
            .map(|r| r.name.as_str())
            .collect()
    }
}

pub fn parse(path: &str) -> anyhow::Result<Config> {
    let file_data =
        std::fs::read(path).context("Failed to read given config.toml")?;
    let config = toml::from_str::<Config>(
        std::str::from_utf8(&file_data)
            .context("config should be valid utf-8")?,
    )?;

    let missing = config.undefined_buffers();
    if !missing.is_empty() {
        anyhow::bail!("submit steps name undefined buffers: {missing:?}");
    }
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use uhgsmi::Mode;

    const SCRIPT: &str = r#"
        [engine]
        mode = "escape"
        context = "gl"

        [buffer.cmds]
        size = 8192
        sync = "event"
        fill = 0xcc

        [buffer.data]
        size = 4096

        [[submit]]
        buffers = [
            { name = "cmds" },
            { name = "data", off = 1024, cb = 512, flags = ["host_read_only"] },
        ]

        [[submit]]
        buffers = [{ name = "data", off = 2048 }]

        [sim]
        command_buffer_size = 1024
    "#;

    #[test]
    fn parse_script() {
        let cfg: Config = toml::from_str(SCRIPT).unwrap();
        assert_eq!(cfg.engine.mode, Mode::Escape);
        assert_eq!(cfg.buffers.len(), 2);
        assert_eq!(cfg.buffers["cmds"].sync, SyncKind::Event);
        assert_eq!(cfg.buffers["cmds"].fill, Some(0xcc));
        assert_eq!(cfg.buffers["data"].sync, SyncKind::None);
        assert_eq!(cfg.sim.command_buffer_size, 1024);
        assert_eq!(cfg.sim.allocation_list_len, 32);

        let first = &cfg.submits[0].buffers;
        assert_eq!(first[0].range(8192), None);
        assert_eq!(first[1].range(4096), Some((1024, 512)));
        assert_eq!(first[1].flags(), SubmitFlags::HOST_READ_ONLY);
        assert_eq!(cfg.submits[1].buffers[0].range(4096), Some((2048, 2048)));
        assert!(cfg.undefined_buffers().is_empty());
    }

    #[test]
    fn empty_script() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.engine, EngineConfig::default());
        assert!(cfg.buffers.is_empty() && cfg.submits.is_empty());
    }

    #[test]
    fn undefined_buffer_found() {
        let cfg: Config =
            toml::from_str("[[submit]]\nbuffers = [{ name = \"nope\" }]\n")
                .unwrap();
        assert_eq!(cfg.undefined_buffers(), vec!["nope"]);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[buffer.a]\nsize = 1\nsink = 2\n")
            .is_err());
        assert!(toml::from_str::<Config>(
            "[[submit]]\nbuffers = [{ name = \"a\", flags = [\"loud\"] }]\n"
        )
        .is_err());
    }
}
