//! Profile-guided optimization support.
//!
//! The instrumented compiler writes one `.profraw` file per module into the
//! profiles directory while it builds the next stage. Those files are then
//! merged into a single `merged.profdata`.

use crate::error::BuildError;
use crate::exec::{Invocation, Runner};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const PROFILE_ENV: &str = "LLVM_PROFILE_FILE";
pub const MERGED_PROFILE: &str = "merged.profdata";

/// Where an instrumented compiler writes its raw profiles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileCollection {
    dir: PathBuf,
}

impl ProfileCollection {
    /// Create (if needed) the profiles directory.
    pub fn create(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    #[cfg(test)]
    fn dir(&self) -> &Path {
        &self.dir
    }

    /// Environment for commands run by the instrumented compiler.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(
            PROFILE_ENV.to_string(),
            format!("{}/%m.profraw", self.dir.display()),
        )]
    }

    /// Raw profiles written so far, sorted by name.
    pub fn raw_profiles(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "profraw") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Merge every raw profile into `<out_dir>/merged.profdata`.
    pub fn merge(
        &self,
        llvm_profdata: &Path,
        out_dir: &Path,
        runner: &mut dyn Runner,
    ) -> Result<PathBuf> {
        let raw = self.raw_profiles()?;
        log::info!("Merging {} raw profiles", raw.len());

        runner.run(
            &Invocation::new(llvm_profdata, out_dir)
                .args(["merge", "-o", MERGED_PROFILE])
                .args(raw.iter().map(|p| p.display().to_string())),
        )?;

        let merged = out_dir.join(MERGED_PROFILE);
        if !merged.exists() {
            return Err(BuildError::MissingArtifact {
                stage: 3,
                path: merged,
            }
            .into());
        }
        Ok(merged)
    }
}

/// Copy the merged profile into the upload directory.
pub fn publish(profile: &Path, upload_dir: Option<&Path>) -> Result<PathBuf> {
    let upload_dir = upload_dir.ok_or(BuildError::MissingEnvironment("UPLOAD_DIR"))?;
    std::fs::create_dir_all(upload_dir)
        .with_context(|| format!("Failed to create {}", upload_dir.display()))?;
    let dest = upload_dir.join(MERGED_PROFILE);
    std::fs::copy(profile, &dest)
        .with_context(|| format!("Failed to copy {}", profile.display()))?;
    log::info!("  Published: {}", dest.display());
    Ok(dest)
}
