//! Reduce a full toolchain install to the clang-tidy package.
//!
//! The whole layout is checked before anything is removed, so an
//! unexpected install tree is left untouched.

use crate::error::BuildError;
use crate::target::Os;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

const TOP_LEVEL: &[&str] = &[
    "bin",
    "include",
    "lib",
    "lib32",
    "libexec",
    "msbuild-bin",
    "share",
    "tools",
];

/// Target-specific runtime directory of Linux installs.
const LINUX_RUNTIME_DIR: &str = "x86_64-unknown-linux-gnu";

/// Directories removed outright.
const REMOVED_DIRS: &[&str] = &["libexec", "msbuild-bin", "tools", LINUX_RUNTIME_DIR];

struct Rules {
    bin: Regex,
    lib: Vec<Regex>,
    clang_version: Regex,
    share_clang: Regex,
}

impl Rules {
    fn new(os: Os) -> Result<Self> {
        let mut lib = vec![Regex::new(r"^clang$")?];
        match os {
            Os::Darwin => {
                lib.push(Regex::new(r"^libLLVM\.dylib$")?);
                lib.push(Regex::new(r"^libclang-cpp\.dylib$")?);
            }
            Os::Linux => {
                lib.push(Regex::new(r"^libLLVM.*\.so.*$")?);
                lib.push(Regex::new(r"^libclang-cpp\.so.*$")?);
            }
            Os::Windows => {}
        }
        Ok(Self {
            bin: Regex::new(
                r"(?i)^(clang-apply-replacements|clang-format|clang-tidy|clangd|clang-query|run-clang-tidy)(\.exe)?$",
            )?,
            lib,
            clang_version: Regex::new(r"^\d+(?:\.\d+\.\d+)?$")?,
            share_clang: Regex::new(r"(?i)format|tidy")?,
        })
    }
}

fn entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let entry = entry?;
        out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    out.sort();
    Ok(out)
}

fn remove(path: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))?;
    log::debug!("  removed {}", path.display());
    Ok(())
}

/// Check that `install_dir` only holds the directories a toolchain install
/// has.
pub fn validate_layout(install_dir: &Path, os: Os) -> Result<()> {
    for (name, path) in entries(install_dir)? {
        let known = TOP_LEVEL.contains(&name.as_str())
            || (os == Os::Linux && name == LINUX_RUNTIME_DIR);
        if !known {
            return Err(BuildError::UnexpectedLayout(format!(
                "unexpected entry in install directory: {name}"
            ))
            .into());
        }
        if !path.is_dir() {
            return Err(BuildError::UnexpectedLayout(format!("{name} is not a directory")).into());
        }
    }
    Ok(())
}

/// Remove everything from `install_dir` that clang-tidy does not need.
pub fn prune_to_clang_tidy(install_dir: &Path, os: Os) -> Result<()> {
    validate_layout(install_dir, os)?;
    let rules = Rules::new(os)?;
    log::info!("Pruning {} to clang-tidy", install_dir.display());

    let bin = install_dir.join("bin");
    if bin.is_dir() {
        for (name, path) in entries(&bin)? {
            if !rules.bin.is_match(&name) {
                remove(&path)?;
            }
        }
    }

    let lib = install_dir.join("lib");
    if lib.is_dir() {
        for (name, path) in entries(&lib)? {
            if !rules.lib.iter().any(|re| re.is_match(&name)) {
                remove(&path)?;
            }
        }
        let clang = lib.join("clang");
        if clang.is_dir() {
            prune_clang_resource_dir(&clang, &rules)?;
        }
    }

    for name in REMOVED_DIRS {
        let path = install_dir.join(name);
        if path.exists() {
            remove(&path)?;
        }
    }

    let share = install_dir.join("share");
    if share.is_dir() {
        for (name, path) in entries(&share)? {
            if name != "clang" {
                remove(&path)?;
            }
        }
        let clang = share.join("clang");
        if clang.is_dir() {
            for (name, path) in entries(&clang)? {
                if !rules.share_clang.is_match(&name) {
                    remove(&path)?;
                }
            }
        }
    }

    Ok(())
}

/// `lib/clang/<version>` keeps only its headers.
fn prune_clang_resource_dir(clang: &Path, rules: &Rules) -> Result<()> {
    for (name, path) in entries(clang)? {
        if !rules.clang_version.is_match(&name) || !path.is_dir() {
            remove(&path)?;
            continue;
        }
        for (inner, inner_path) in entries(&path)? {
            if inner != "include" {
                remove(&inner_path)?;
            }
        }
    }
    Ok(())
}
