// SPDX-License-Identifier: CEPL-1.0
use std::fmt;

/// Pipeline stage a shader entry point is compiled for. All stages share the
/// same compile path; the differences live in the rules below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Task,
    Mesh,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::Task,
        ShaderStage::Mesh,
        ShaderStage::Fragment,
        ShaderStage::Compute,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Task => "task",
            ShaderStage::Mesh => "mesh",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }

    pub(crate) fn kind(self) -> shaderc::ShaderKind {
        match self {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Task => shaderc::ShaderKind::Task,
            ShaderStage::Mesh => shaderc::ShaderKind::Mesh,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        }
    }

    /// Macro defined while preprocessing, so one source file can hold the
    /// entry points of several stages behind `#ifdef` guards.
    pub const fn stage_macro(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "WOVEN_STAGE_VERTEX",
            ShaderStage::Task => "WOVEN_STAGE_TASK",
            ShaderStage::Mesh => "WOVEN_STAGE_MESH",
            ShaderStage::Fragment => "WOVEN_STAGE_FRAGMENT",
            ShaderStage::Compute => "WOVEN_STAGE_COMPUTE",
        }
    }

    /// Oldest SPIR-V version (major, minor) the stage can be expressed in.
    /// Mesh shading arrived with SPIR-V 1.4.
    pub const fn min_spirv(self) -> (u8, u8) {
        match self {
            ShaderStage::Task | ShaderStage::Mesh => (1, 4),
            _ => (1, 0),
        }
    }

    /// Stage that normally consumes this stage's output.
    pub const fn next_stage(self) -> Option<ShaderStage> {
        match self {
            ShaderStage::Vertex | ShaderStage::Mesh => Some(ShaderStage::Fragment),
            ShaderStage::Task => Some(ShaderStage::Mesh),
            ShaderStage::Fragment | ShaderStage::Compute => None,
        }
    }

    /// Stage implied by a single-stage file extension (`.frag`, `.mesh`, ...).
    /// `.glsl` files may hold any stage and map to `None`.
    pub fn from_extension(ext: &str) -> Option<ShaderStage> {
        match ext {
            "vert" => Some(ShaderStage::Vertex),
            "task" => Some(ShaderStage::Task),
            "mesh" => Some(ShaderStage::Mesh),
            "frag" => Some(ShaderStage::Fragment),
            "comp" => Some(ShaderStage::Compute),
            _ => None,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
