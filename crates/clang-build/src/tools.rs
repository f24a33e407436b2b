//! Resolution of the host build tools.

use crate::config::Config;
use crate::env::BuildEnv;
use crate::error::BuildError;
use crate::target::Target;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Return the absolute path of a build tool.
///
/// A config value (after `{VAR}` expansion) that is an absolute path must
/// name an existing program in that directory. Any other value, or the key
/// itself when unset, is looked up on `PATH`.
///
/// The key is expected to match the tool's name in the default toolchain
/// of the system (`ar` on Unix, `lib` on Windows).
pub fn resolve_tool(config: &Config, key: &str, env: &BuildEnv) -> Result<PathBuf> {
    let configured = match config.get_str(key)? {
        Some(value) => Some(env.expand(value)?),
        None => None,
    };

    if let Some(value) = &configured {
        let path = Path::new(value);
        if path.is_absolute() {
            let dir = path.parent().unwrap_or(path);
            let name = path.file_name().unwrap_or_default();
            // which_in also tries PATHEXT suffixes on Windows.
            return which::which_in(name, Some(dir), dir).map_err(|_| {
                BuildError::ToolNotFound(format!("{key} must point to an existing path"))
                    .into()
            });
        }
    }

    let name = configured.as_deref().unwrap_or(key);
    which::which(name)
        .map_err(|_| BuildError::ToolNotFound(format!("{name} not found on PATH")).into())
}

/// Host tools used to build the first stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub asm: PathBuf,
    pub ar: PathBuf,
    pub ranlib: Option<PathBuf>,
    pub libtool: Option<PathBuf>,
}

impl Toolchain {
    pub fn resolve(config: &Config, target: Target, env: &BuildEnv) -> Result<Self> {
        let windows = target.is_windows();
        Ok(Self {
            cc: resolve_tool(config, "cc", env)?,
            cxx: resolve_tool(config, "cxx", env)?,
            asm: resolve_tool(config, if windows { "ml" } else { "as" }, env)?,
            // lld is not on PATH, but clang finds it next to itself.
            ar: resolve_tool(config, if windows { "lib" } else { "ar" }, env)?,
            ranlib: if windows {
                None
            } else {
                Some(resolve_tool(config, "ranlib", env)?)
            },
            libtool: if target.is_darwin() {
                Some(resolve_tool(config, "libtool", env)?)
            } else {
                None
            },
        })
    }
}
