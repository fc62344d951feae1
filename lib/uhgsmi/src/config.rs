// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use kmt_api::{ContextKind, DEFAULT_DRIVER_MODULE};
use serde::{Deserialize, Serialize};

/// How buffers are allocated and submissions reach the driver.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Allocations, page locks and DMA command buffers through the render
    /// thunks.
    #[default]
    Direct,
    /// Everything through driver-private escapes.
    Escape,
}
impl Mode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Escape => "escape",
        }
    }
}

/// Largest batch the host accepts through a single submit escape.
pub const DEFAULT_ESCAPE_BATCH_LIMIT: usize = 3;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub mode: Mode,
    pub context: ContextKind,
    /// Module exporting the driver thunks.
    pub driver_module: String,
    /// GDI display name (`\\.\DISPLAY2` and so on) of the adapter to open.
    /// The primary display's adapter is used when absent.
    pub display: Option<String>,
    pub escape_batch_limit: usize,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Direct,
            context: ContextKind::D3D,
            driver_module: DEFAULT_DRIVER_MODULE.to_string(),
            display: None,
            escape_batch_limit: DEFAULT_ESCAPE_BATCH_LIMIT,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_is_default() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.driver_module, "gdi32.dll");
        assert_eq!(cfg.escape_batch_limit, 3);
    }

    #[test]
    fn parse_full() {
        let raw = r#"
            mode = "escape"
            context = "gl"
            driver_module = "vboxgdi.dll"
            display = '\\.\DISPLAY2'
            escape_batch_limit = 5
        "#;
        let cfg: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.mode, Mode::Escape);
        assert_eq!(cfg.context, ContextKind::GL);
        assert_eq!(cfg.driver_module, "vboxgdi.dll");
        assert_eq!(cfg.display.as_deref(), Some("\\\\.\\DISPLAY2"));
        assert_eq!(cfg.escape_batch_limit, 5);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<EngineConfig>("frobnicate = 1").is_err());
        assert!(toml::from_str::<EngineConfig>("mode = \"gpu\"").is_err());
    }
}
