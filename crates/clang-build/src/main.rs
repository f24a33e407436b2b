//! Build a clang toolchain from the llvm-project checkout in the current
//! directory.
//!
//! ```bash
//! clang-build -c linux64.json -c pgo.json     # build and package
//! clang-build -c clang-tidy.json --clang-plugin-dir ../clang-plugin
//! clang-build -c linux64.json --clean         # remove build/
//! ```

use anyhow::{Context, Result};
use clang_build::build::{self, BuildArgs};
use clang_build::env::BuildEnv;
use clang_build::exec::SystemRunner;
use clang_build::pipeline::Outcome;
use clang_build::target::Host;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clang-build", about = "Staged clang toolchain builder")]
struct Cli {
    /// Clang configuration file; later files override earlier ones
    #[arg(short = 'c', long, required = true)]
    config: Vec<PathBuf>,

    /// Clean the build directory
    #[arg(long)]
    clean: bool,

    /// Skip tar packaging stage
    #[arg(long)]
    skip_tar: bool,

    /// Do not patch source
    #[arg(long)]
    skip_patch: bool,

    /// Directory holding import_mozilla_checks.py, for clang-tidy builds
    #[arg(long)]
    clang_plugin_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder().filter_level(log_level).init();

    let source_dir = std::env::current_dir().context("Failed to get current directory")?;

    if cli.clean {
        return build::clean(&source_dir);
    }

    let env = BuildEnv::from_process();
    let mut runner = SystemRunner::new(env.upload_dir());
    let args = BuildArgs {
        configs: cli.config,
        skip_tar: cli.skip_tar,
        skip_patch: cli.skip_patch,
        clang_plugin_dir: cli.clang_plugin_dir,
    };

    match build::run(&args, &source_dir, env, Host::current(), &mut runner)? {
        Outcome::Installed { install_dir, .. } => {
            log::info!("Toolchain installed in {}", install_dir.display());
        }
        Outcome::ProfileOnly { profile } => {
            log::info!("Profile written to {}", profile.display());
        }
    }
    Ok(())
}
