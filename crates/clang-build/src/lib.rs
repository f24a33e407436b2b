//! # clang-build
//!
//! Builds a clang/LLVM toolchain from an llvm-project checkout in up to four
//! bootstrap stages, optionally with profile-guided optimization, and
//! packages the result as a `.tar.zst` archive.
//!
//! ## Flow
//!
//! 1. JSON configuration files are merged ([`config`])
//! 2. The target is resolved against the host ([`target`]) and the host
//!    tools are located ([`tools`])
//! 3. Patches are applied ([`patch`])
//! 4. Stages are planned and built in order ([`pipeline`], [`stage`])
//! 5. The final install is pruned for clang-tidy ([`prune`]) and archived
//!    ([`archive`])
//!
//! External programs only run through [`exec::Runner`].

pub mod archive;
pub mod build;
pub mod config;
pub mod env;
pub mod error;
pub mod exec;
pub mod flags;
pub mod patch;
pub mod pgo;
pub mod pipeline;
pub mod prune;
pub mod record;
pub mod stage;
pub mod target;
pub mod tools;

pub use error::BuildError;
