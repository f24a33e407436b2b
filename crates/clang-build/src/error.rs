//! Error taxonomy for the toolchain build.
//!
//! Every fallible function returns `anyhow::Result`; the variants below are
//! the root causes callers may want to match on with `downcast_ref`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("{source_name} is overriding `{key}` with a value of the wrong type")]
    ConfigTypeConflict { key: String, source_name: String },

    #[error("{0} is not a supported target")]
    UnsupportedTarget(String),

    #[error("cannot build on {system} {machine}")]
    UnsupportedHost { system: String, machine: String },

    #[error("unsupported cross-compilation: {0}")]
    UnsupportedCrossCompile(String),

    #[error("{0}")]
    ToolNotFound(String),

    #[error("`{command}` failed with {status}")]
    ExternalBuildFailure { command: String, status: String },

    #[error("unexpected layout: {0}")]
    UnexpectedLayout(String),

    #[error("stage {stage} expected {} to exist", path.display())]
    MissingArtifact { stage: u8, path: PathBuf },

    #[error("{0} must be set")]
    MissingEnvironment(&'static str),

    #[error("must be run from the root directory of the llvm-project tree")]
    NotSourceTree,
}
