//! Path resolution for watchctl
//!
//! # Environment Variables
//!
//! - `WATCHCTL_ROOT` - Working root when `--root` is not given
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   watchctl.toml | watchctl.json
//!   .watchctl/
//!     state.json
//!     apply.lock
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for the working root
pub const ENV_ROOT: &str = "WATCHCTL_ROOT";

/// Name of the state directory under the root
pub const STATE_DIR_NAME: &str = ".watchctl";

/// Configuration file names probed in the root, in order
pub const CONFIG_FILE_NAMES: [&str; 2] = ["watchctl.toml", "watchctl.json"];

/// Resolve the working root
///
/// Priority:
/// 1. `--root` flag
/// 2. `WATCHCTL_ROOT` env var
/// 3. Current directory
pub fn root(flag: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        let path = expand(dir);
        log::debug!("Using root from --root: {}", path.display());
        return Ok(path);
    }

    if let Ok(dir) = std::env::var(ENV_ROOT) {
        let path = expand(&dir);
        log::debug!("Using root from {}: {}", ENV_ROOT, path.display());
        return Ok(path);
    }

    let cwd = std::env::current_dir().context("Could not determine current directory")?;
    log::debug!("Using current directory as root: {}", cwd.display());
    Ok(cwd)
}

/// State directory for a root
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR_NAME)
}

/// Find the configuration file
///
/// An explicit path wins; otherwise the first existing candidate in the root.
pub fn config_file(root: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(expand(&path.to_string_lossy()));
    }

    CONFIG_FILE_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
        .with_context(|| {
            format!(
                "No configuration found in {} (expected {})",
                root.display(),
                CONFIG_FILE_NAMES.join(" or ")
            )
        })
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================
