//! Source tree preparation: patches and the clang-tidy check import.

use crate::config::ClangTidy;
use crate::exec::{Invocation, Runner};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Apply `patch` to the tree at `source_dir`. Patches must apply cleanly.
pub fn apply_patch(patch: &Path, source_dir: &Path, runner: &mut dyn Runner) -> Result<()> {
    let patch = patch
        .canonicalize()
        .with_context(|| format!("Patch not found: {}", patch.display()))?;
    log::info!("Applying {}", patch.display());
    runner.run(
        &Invocation::new("patch", source_dir)
            .arg("-d")
            .arg(source_dir.display().to_string())
            .args(["-p1", "-i"])
            .arg(patch.display().to_string())
            .args(["--fuzz=0", "-s"]),
    )
}

pub fn apply_patches(
    patches: &[PathBuf],
    source_dir: &Path,
    runner: &mut dyn Runner,
) -> Result<()> {
    for patch in patches {
        apply_patch(patch, source_dir, runner)?;
    }
    Ok(())
}

/// Copy the in-tree checks from `plugin_dir` into clang-tidy's sources.
pub fn import_clang_tidy(
    plugin_dir: &Path,
    source_dir: &Path,
    options: ClangTidy,
    runner: &mut dyn Runner,
) -> Result<()> {
    let script = plugin_dir.join("import_mozilla_checks.py");
    let clang_tidy = source_dir.join("clang-tools-extra/clang-tidy");

    let mut invocation = Invocation::new("python3", source_dir)
        .arg(script.display().to_string())
        .arg(plugin_dir.display().to_string())
        .arg(clang_tidy.display().to_string());
    if options.alpha {
        invocation = invocation.arg("--alpha");
    }
    if options.external {
        invocation = invocation.arg("--external");
    }
    runner.run(&invocation)
}
