// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;

use crate::bindless::BindlessCapacities;
use crate::shader::ShaderConfig;
use crate::wait::FrameTimeouts;

/// Everything the renderer reads from the `[render]` config table.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub timeouts: FrameTimeouts,
    pub shader: ShaderConfig,
    pub bindless: BindlessCapacities,
    /// Enable validation layers and the debug messenger in debug builds.
    pub validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            timeouts: FrameTimeouts::default(),
            shader: ShaderConfig::default(),
            bindless: BindlessCapacities::default(),
            validation: true,
        }
    }
}
