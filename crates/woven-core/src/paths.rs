// SPDX-License-Identifier: CEPL-1.0
//! Locating on-disk shader sources relative to the running process.
//!
//! Binaries are usually launched either from the workspace root or from
//! somewhere below `target/`, so every lookup tries the working directory and
//! the executable's directory first and then walks a bounded number of parents.

use std::path::{Path, PathBuf};
use tracing::debug;

/// Conventional name of the shader source directory.
pub const SHADER_DIR: &str = "shaders";
/// How many parent directories the upward search visits.
pub const MAX_UPWARD_STEPS: usize = 5;

/// Returns the first directory named `name` found in `start` or one of its
/// ancestors, visiting at most `max_steps` parents.
pub fn find_upwards(start: &Path, name: &str, max_steps: usize) -> Option<PathBuf> {
    start
        .ancestors()
        .take(max_steps + 1)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_dir())
}

/// Directory containing the current executable, if it can be determined.
pub fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}

/// Resolves the shader directory: `cwd/shaders`, then `<exe dir>/shaders`,
/// then an upward search from both.
pub fn shader_dir() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok();
    let found = resolve_dir(SHADER_DIR, cwd.as_deref(), exe_dir().as_deref());
    debug!(?found, "shader directory lookup");
    found
}

fn resolve_dir(name: &str, cwd: Option<&Path>, exe: Option<&Path>) -> Option<PathBuf> {
    let direct = [cwd, exe]
        .into_iter()
        .flatten()
        .map(|base| base.join(name))
        .find(|p| p.is_dir());
    direct.or_else(|| {
        [cwd, exe]
            .into_iter()
            .flatten()
            .find_map(|base| find_upwards(base, name, MAX_UPWARD_STEPS))
    })
}
