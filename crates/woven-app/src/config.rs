// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};
use woven_platform::{DEFAULT_SIZE, DEFAULT_TITLE};
use woven_render::RenderConfig;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_owned(),
            width: DEFAULT_SIZE.width,
            height: DEFAULT_SIZE.height,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderConfig,
}

/// Reads `path`. A missing file means defaults; a broken one is reported and
/// also falls back to defaults so a typo never keeps the window from opening.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match toml::from_str::<AppCfg>(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("ignoring {}: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{} not found, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            AppCfg::default()
        }
    }
}
