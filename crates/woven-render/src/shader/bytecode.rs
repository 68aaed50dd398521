// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V container checks applied to every compiled module.

use serde::Deserialize;
use tracing::{debug, error};

use super::ShaderStage;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;
/// Magic, version, generator, id bound, schema.
pub const HEADER_WORDS: usize = 5;

/// What to do when the first word is not [`SPIRV_MAGIC`].
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MagicPolicy {
    /// Log at error level and keep the bytecode.
    #[default]
    Log,
    /// Fail the compilation.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BytecodeError {
    #[error("bytecode is empty")]
    Empty,
    #[error("bytecode length {0} is not a multiple of 4")]
    Misaligned(usize),
    #[error("bytecode has {0} words, shorter than the {HEADER_WORDS}-word header")]
    Truncated(usize),
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("SPIR-V {}.{} is older than the {}.{} a {stage} shader needs", .found.0, .found.1, .required.0, .required.1)]
    VersionTooOld {
        stage: ShaderStage,
        found: (u8, u8),
        required: (u8, u8),
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpirvHeader {
    pub magic: u32,
    pub version: (u8, u8),
    pub generator: u32,
    pub bound: u32,
}

/// Validated, word-aligned shader bytecode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bytecode {
    words: Vec<u32>,
}

impl Bytecode {
    /// Checks `bytes` (little-endian words) against the container rules and
    /// the stage's version floor.
    pub fn validate(bytes: &[u8], stage: ShaderStage, policy: MagicPolicy) -> Result<Self, BytecodeError> {
        if bytes.is_empty() {
            return Err(BytecodeError::Empty);
        }
        if bytes.len() % 4 != 0 {
            return Err(BytecodeError::Misaligned(bytes.len()));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        if words.len() < HEADER_WORDS {
            return Err(BytecodeError::Truncated(words.len()));
        }

        let code = Bytecode { words };
        let header = code.header();
        if header.magic != SPIRV_MAGIC {
            match policy {
                MagicPolicy::Reject => return Err(BytecodeError::BadMagic(header.magic)),
                MagicPolicy::Log => {
                    error!(
                        "{stage} bytecode has bad magic 0x{:08x} (expected 0x{SPIRV_MAGIC:08x}); continuing",
                        header.magic
                    );
                    return Ok(code);
                }
            }
        }

        let required = stage.min_spirv();
        if header.version < required {
            return Err(BytecodeError::VersionTooOld {
                stage,
                found: header.version,
                required,
            });
        }
        debug!(
            "{stage} SPIR-V {}.{}, {} words, magic 0x{:08x}",
            header.version.0,
            header.version.1,
            code.words.len(),
            header.magic
        );
        Ok(code)
    }

    pub fn header(&self) -> SpirvHeader {
        let version = self.words[1];
        SpirvHeader {
            magic: self.words[0],
            version: (((version >> 16) & 0xff) as u8, ((version >> 8) & 0xff) as u8),
            generator: self.words[2],
            bound: self.words[3],
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(magic: u32, version: u32, extra_words: usize) -> Vec<u8> {
        let mut words = vec![magic, version, 0x000d_000b, 42, 0];
        words.extend(std::iter::repeat(0u32).take(extra_words));
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    const V1_5: u32 = 0x0001_0500;
    const V1_0: u32 = 0x0001_0000;

    #[test]
    fn accepts_well_formed_module() {
        let code = Bytecode::validate(&module(SPIRV_MAGIC, V1_5, 3), ShaderStage::Mesh, MagicPolicy::Reject).unwrap();
        let h = code.header();
        assert_eq!(h.version, (1, 5));
        assert_eq!(h.bound, 42);
        assert_eq!(code.len_bytes(), 32);
        assert_eq!(&code.as_bytes()[..4], &SPIRV_MAGIC.to_le_bytes());
    }

    #[test]
    fn rejects_empty_misaligned_and_short() {
        let p = MagicPolicy::Log;
        assert_eq!(Bytecode::validate(&[], ShaderStage::Vertex, p), Err(BytecodeError::Empty));
        assert_eq!(
            Bytecode::validate(&[3, 2, 35, 7, 0], ShaderStage::Vertex, p),
            Err(BytecodeError::Misaligned(5))
        );
        let short = &module(SPIRV_MAGIC, V1_5, 0)[..16];
        assert_eq!(Bytecode::validate(short, ShaderStage::Vertex, p), Err(BytecodeError::Truncated(4)));
    }

    #[test]
    fn magic_policy_decides() {
        let bad = module(0xdead_beef, V1_5, 0);
        assert!(Bytecode::validate(&bad, ShaderStage::Fragment, MagicPolicy::Log).is_ok());
        assert_eq!(
            Bytecode::validate(&bad, ShaderStage::Fragment, MagicPolicy::Reject),
            Err(BytecodeError::BadMagic(0xdead_beef))
        );
    }

    #[test]
    fn stage_version_floor() {
        let old = module(SPIRV_MAGIC, V1_0, 0);
        assert!(Bytecode::validate(&old, ShaderStage::Fragment, MagicPolicy::Reject).is_ok());
        assert!(matches!(
            Bytecode::validate(&old, ShaderStage::Task, MagicPolicy::Reject),
            Err(BytecodeError::VersionTooOld { required: (1, 4), .. })
        ));
    }
}
