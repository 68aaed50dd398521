// SPDX-License-Identifier: CEPL-1.0
//! Startup shader compilation: source module on disk to validated SPIR-V.
//!
//! A module is one file named by its stem. One file may carry entry points for
//! several stages; each compile defines the stage's macro while preprocessing
//! and renames the chosen entry point to [`ENTRY_POINT_NAME`], which is the
//! only name shader objects are created with.

mod bytecode;
mod stage;

pub use bytecode::{Bytecode, BytecodeError, MagicPolicy, SpirvHeader, HEADER_WORDS, SPIRV_MAGIC};
pub use stage::ShaderStage;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shaderc::{CompilationArtifact, IncludeCallbackResult, IncludeType, ResolvedInclude};
use tracing::{info, warn};

/// Entry point name every compiled stage is exposed under.
pub const ENTRY_POINT_NAME: &str = "main";
/// Extensions tried, in order, when resolving a module stem.
pub const SOURCE_EXTENSIONS: [&str; 6] = ["glsl", "vert", "task", "mesh", "frag", "comp"];
const TARGET_SPIRV: (u8, u8) = (1, 5);

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShaderConfig {
    /// Searched before the conventional shader directory.
    pub dir: Option<PathBuf>,
    pub dump_bytecode: bool,
    pub cache_dir: PathBuf,
    pub magic_policy: MagicPolicy,
    pub optimize: bool,
    pub debug_info: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            dir: None,
            dump_bytecode: true,
            cache_dir: PathBuf::from("shader_cache"),
            magic_policy: MagicPolicy::Log,
            optimize: true,
            debug_info: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("shader compiler unavailable ({what}): {message}")]
    Unavailable { what: &'static str, message: String },
    #[error("{} only holds {found} code; {wanted} was requested", .path.display())]
    StageMismatch {
        path: PathBuf,
        found: ShaderStage,
        wanted: ShaderStage,
    },
    #[error("shader module '{module}' not found (searched {searched:?})")]
    ModuleNotFound { module: String, searched: Vec<PathBuf> },
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{module}: front end failed:\n{diagnostics}")]
    Frontend { module: String, diagnostics: String },
    #[error("{module}: no {stage} entry point named '{entry}'")]
    EntryPointNotFound {
        module: String,
        entry: String,
        stage: ShaderStage,
    },
    #[error("{module}:{entry}: link failed:\n{diagnostics}")]
    Link {
        module: String,
        entry: String,
        diagnostics: String,
    },
    #[error("{module}:{entry}: {source}")]
    Bytecode {
        module: String,
        entry: String,
        #[source]
        source: BytecodeError,
    },
}

/// One stage's executable form and where it came from.
#[derive(Clone, Debug)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub module: String,
    pub entry_point: String,
    pub bytecode: Bytecode,
}

impl CompiledShader {
    /// Name the entry point is exposed under in the bytecode.
    pub fn exposed_name(&self) -> &'static str {
        ENTRY_POINT_NAME
    }
}

/// A (module, entry point, stage) triple of the startup set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderRequest<'a> {
    pub module: &'a str,
    pub entry_point: &'a str,
    pub stage: ShaderStage,
}

pub struct ShaderCompiler {
    compiler: shaderc::Compiler,
    search_paths: Vec<PathBuf>,
    config: ShaderConfig,
}

impl ShaderCompiler {
    pub fn new(config: &ShaderConfig) -> Result<Self, CompileError> {
        let compiler = shaderc::Compiler::new().map_err(|e| CompileError::Unavailable {
            what: "compiler",
            message: e.to_string(),
        })?;
        let mut search_paths: Vec<PathBuf> = config.dir.iter().cloned().collect();
        if let Some(dir) = woven_core::paths::shader_dir() {
            if !search_paths.contains(&dir) {
                search_paths.push(dir);
            }
        }
        if search_paths.is_empty() {
            warn!("no shader directory found; every compile will fail to resolve");
        }
        Ok(Self {
            compiler,
            search_paths,
            config: config.clone(),
        })
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Compiles every request, stopping at the first failure.
    pub fn compile_all(&mut self, requests: &[ShaderRequest<'_>]) -> Result<Vec<CompiledShader>, CompileError> {
        requests
            .iter()
            .map(|r| self.compile(r.module, r.entry_point, r.stage))
            .collect()
    }

    pub fn compile(&mut self, module: &str, entry: &str, stage: ShaderStage) -> Result<CompiledShader, CompileError> {
        let path = self.resolve(module)?;
        if let Some(found) = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ShaderStage::from_extension)
        {
            if found != stage {
                return Err(CompileError::StageMismatch {
                    path,
                    found,
                    wanted: stage,
                });
            }
        }
        let source = fs::read_to_string(&path).map_err(|source| CompileError::Read {
            path: path.clone(),
            source,
        })?;
        let file_name = path.display().to_string();

        let mut opts = self.options(stage)?;
        opts.add_macro_definition(stage.stage_macro(), Some("1"));
        let pre = self
            .compiler
            .preprocess(&source, &file_name, ENTRY_POINT_NAME, Some(&opts))
            .map_err(|e| CompileError::Frontend {
                module: module.to_owned(),
                diagnostics: e.to_string(),
            })?;
        log_warnings(module, "front end", &pre);
        let expanded = pre.as_text();

        if !defines_function(&expanded, entry) {
            return Err(CompileError::EntryPointNotFound {
                module: module.to_owned(),
                entry: entry.to_owned(),
                stage,
            });
        }

        let mut opts = self.options(stage)?;
        if entry != ENTRY_POINT_NAME {
            opts.add_macro_definition(entry, Some(ENTRY_POINT_NAME));
        }
        let artifact = self
            .compiler
            .compile_into_spirv(&expanded, stage.kind(), &file_name, ENTRY_POINT_NAME, Some(&opts))
            .map_err(|e| CompileError::Link {
                module: module.to_owned(),
                entry: entry.to_owned(),
                diagnostics: e.to_string(),
            })?;
        log_warnings(module, entry, &artifact);

        let bytecode = Bytecode::validate(artifact.as_binary_u8(), stage, self.config.magic_policy).map_err(
            |source| CompileError::Bytecode {
                module: module.to_owned(),
                entry: entry.to_owned(),
                source,
            },
        )?;
        if self.config.dump_bytecode {
            self.dump(module, entry, &bytecode);
        }
        info!("compiled {module}:{entry} ({stage}, {} bytes)", bytecode.len_bytes());

        Ok(CompiledShader {
            stage,
            module: module.to_owned(),
            entry_point: entry.to_owned(),
            bytecode,
        })
    }

    /// First `<dir>/<module>.<ext>` that exists, in search path order.
    pub fn resolve(&self, module: &str) -> Result<PathBuf, CompileError> {
        self.search_paths
            .iter()
            .flat_map(|dir| SOURCE_EXTENSIONS.iter().map(move |ext| dir.join(format!("{module}.{ext}"))))
            .find(|p| p.is_file())
            .ok_or_else(|| CompileError::ModuleNotFound {
                module: module.to_owned(),
                searched: self.search_paths.clone(),
            })
    }

    fn options(&self, stage: ShaderStage) -> Result<shaderc::CompileOptions<'static>, CompileError> {
        let mut opts = shaderc::CompileOptions::new().map_err(|e| CompileError::Unavailable {
            what: "compile options",
            message: e.to_string(),
        })?;
        opts.set_source_language(shaderc::SourceLanguage::GLSL);
        opts.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_3 as u32);
        opts.set_target_spirv(spirv_version(TARGET_SPIRV.max(stage.min_spirv())));
        if self.config.optimize {
            opts.set_optimization_level(shaderc::OptimizationLevel::Performance);
        }
        if self.config.debug_info {
            opts.set_generate_debug_info();
        }
        let search = self.search_paths.clone();
        opts.set_include_callback(move |requested, ty, requesting, _depth| {
            resolve_include(&search, requested, ty, requesting)
        });
        Ok(opts)
    }

    fn dump(&self, module: &str, entry: &str, bytecode: &Bytecode) {
        let path = self.config.cache_dir.join(format!("{module}_{entry}.spv"));
        let written = fs::create_dir_all(&self.config.cache_dir).and_then(|()| fs::write(&path, bytecode.as_bytes()));
        if let Err(e) = written {
            warn!("could not write bytecode cache {}: {e}", path.display());
        }
    }
}

fn spirv_version(v: (u8, u8)) -> shaderc::SpirvVersion {
    match v {
        (1, 0) => shaderc::SpirvVersion::V1_0,
        (1, 1) => shaderc::SpirvVersion::V1_1,
        (1, 2) => shaderc::SpirvVersion::V1_2,
        (1, 3) => shaderc::SpirvVersion::V1_3,
        (1, 4) => shaderc::SpirvVersion::V1_4,
        (1, 5) => shaderc::SpirvVersion::V1_5,
        _ => shaderc::SpirvVersion::V1_6,
    }
}

fn resolve_include(search: &[PathBuf], requested: &str, ty: IncludeType, requesting: &str) -> IncludeCallbackResult {
    let beside = match ty {
        IncludeType::Relative => Path::new(requesting).parent().map(|d| d.join(requested)),
        IncludeType::Standard => None,
    };
    beside
        .into_iter()
        .chain(search.iter().map(|d| d.join(requested)))
        .find_map(|path| {
            fs::read_to_string(&path).ok().map(|content| ResolvedInclude {
                resolved_name: path.display().to_string(),
                content,
            })
        })
        .ok_or_else(|| format!("cannot find '{requested}' (included from {requesting})"))
}

fn log_warnings(module: &str, step: &str, artifact: &CompilationArtifact) {
    if artifact.get_num_warnings() > 0 {
        warn!("{module} ({step}): {}", artifact.get_warning_messages().trim_end());
    }
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whether `source` defines a function `name`: the identifier preceded by a
/// return type and followed by an opening parenthesis.
fn defines_function(source: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    source.match_indices(name).any(|(at, _)| {
        let before = &source[..at];
        let after = &source[at + name.len()..];
        let starts_word = !before.chars().next_back().is_some_and(is_ident);
        let opens_call = after.trim_start().starts_with('(');
        let has_return_type = before
            .trim_end_matches([' ', '\t'])
            .chars()
            .next_back()
            .is_some_and(is_ident)
            && before.chars().next_back().is_some_and(char::is_whitespace);
        starts_word && opens_call && has_return_type
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_definitions_not_calls() {
        let src = "void helper() {}\nvoid taskMain() { helper(); }\n";
        assert!(defines_function(src, "taskMain"));
        assert!(defines_function(src, "helper"));
        assert!(!defines_function(src, "meshMain"));

        let called_only = "void main() { fragMain(); }";
        assert!(!defines_function(called_only, "fragMain"));
    }

    #[test]
    fn identifier_boundaries_matter() {
        let src = "void fragMainExtra() {}\nvoid myfragMain() {}";
        assert!(!defines_function(src, "fragMain"));
        assert!(defines_function("vec4 shade (vec2 uv) {}", "shade"));
    }

    #[test]
    fn unavailable_compiler_keeps_its_reason() {
        let err = CompileError::Unavailable {
            what: "compiler",
            message: "libshaderc_shared.so: cannot open shared object file".into(),
        };
        let text = err.to_string();
        assert!(text.contains("compiler"), "{text}");
        assert!(text.contains("cannot open shared object file"), "{text}");
    }

    #[test]
    fn spirv_target_respects_stage_floor() {
        assert_eq!(TARGET_SPIRV.max(ShaderStage::Task.min_spirv()), (1, 5));
        assert!(matches!(spirv_version((1, 4)), shaderc::SpirvVersion::V1_4));
    }

    #[test]
    fn include_lookup_prefers_requesting_dir() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("common.glsl"), "// a").unwrap();
        fs::write(b.path().join("common.glsl"), "// b").unwrap();
        let requesting = a.path().join("main.glsl");

        let got = resolve_include(
            &[b.path().to_path_buf()],
            "common.glsl",
            IncludeType::Relative,
            &requesting.display().to_string(),
        )
        .unwrap();
        assert_eq!(got.content, "// a");

        let got = resolve_include(
            &[b.path().to_path_buf()],
            "common.glsl",
            IncludeType::Standard,
            &requesting.display().to_string(),
        )
        .unwrap();
        assert_eq!(got.content, "// b");
        assert!(resolve_include(&[], "missing.glsl", IncludeType::Standard, "x").is_err());
    }
}
