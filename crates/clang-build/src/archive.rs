//! Packaging of the final install tree as a zstd-compressed tarball.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::Path;

pub const ARCHIVE_SUFFIX: &str = ".tar.zst";

/// Archive `base/directory` into `name`, with `directory` as the top-level
/// entry of the tarball.
pub fn build_tar_package(name: &Path, base: &Path, directory: &str) -> Result<()> {
    if !name.to_string_lossy().ends_with(ARCHIVE_SUFFIX) {
        bail!("Archive name must end with {ARCHIVE_SUFFIX}: {}", name.display());
    }
    log::info!("Creating {}", name.display());

    let file =
        File::create(name).with_context(|| format!("Failed to create {}", name.display()))?;
    let encoder = zstd::stream::write::Encoder::new(file, 0)?;

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(directory, base.join(directory))
        .with_context(|| format!("Failed to archive {}", base.join(directory).display()))?;

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}
