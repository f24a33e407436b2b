//! End-to-end toolchain build: configuration, source preparation, stages,
//! packaging.

use crate::archive::{self, ARCHIVE_SUFFIX};
use crate::config::{self, BuildOptions, Config};
use crate::env::BuildEnv;
use crate::error::BuildError;
use crate::exec::Runner;
use crate::flags::PlatformFlags;
use crate::patch;
use crate::pipeline::{self, Orchestrator, Outcome};
use crate::prune;
use crate::record::RunRecord;
use crate::stage::StageContext;
use crate::target::{is_llvm_toolchain, Host, TargetContext};
use crate::tools::{self, Toolchain};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Marker file of an llvm-project checkout.
const SOURCE_MARKER: &str = "llvm/README.txt";

/// What the command line asked for.
#[derive(Clone, Debug, Default)]
pub struct BuildArgs {
    pub configs: Vec<PathBuf>,
    pub skip_tar: bool,
    pub skip_patch: bool,
    pub clang_plugin_dir: Option<PathBuf>,
}

pub fn build_dir(source_dir: &Path) -> PathBuf {
    source_dir.join("build")
}

fn check_source_tree(source_dir: &Path) -> Result<()> {
    if !source_dir.join(SOURCE_MARKER).exists() {
        return Err(BuildError::NotSourceTree.into());
    }
    Ok(())
}

/// Remove the build directory of `source_dir`.
pub fn clean(source_dir: &Path) -> Result<()> {
    check_source_tree(source_dir)?;
    let dir = build_dir(source_dir);
    if dir.exists() {
        log::info!("Removing {}", dir.display());
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

/// Load and merge the configuration files, in order.
pub fn load_config(paths: &[PathBuf]) -> Result<Config> {
    let docs = paths
        .iter()
        .map(|path| Ok((path.display().to_string(), Config::load(path)?)))
        .collect::<Result<Vec<_>>>()?;
    let config = config::merge_all(docs)?;
    config.warn_unknown_keys();
    log::debug!("Merged configuration: {}", config.to_json());
    Ok(config)
}

/// Build the toolchain in `source_dir`, an llvm-project checkout.
pub fn run(
    args: &BuildArgs,
    source_dir: &Path,
    env: BuildEnv,
    host: Host,
    runner: &mut dyn Runner,
) -> Result<Outcome> {
    check_source_tree(source_dir)?;

    let config = load_config(&args.configs)?;
    let options = BuildOptions::from_config(&config)?;
    let target = TargetContext::resolve(options.target, host)?;
    log::info!(
        "Building {} for {}{}",
        options.package_name(),
        target.target,
        if target.cross { " (cross)" } else { "" }
    );

    let toolchain = Toolchain::resolve(&config, target.target, &env)?;
    target.check_compiler(&toolchain.cc, &toolchain.cxx)?;

    if !args.skip_patch {
        patch::apply_patches(&options.patches, source_dir, runner)?;
    }
    if let Some(clang_tidy) = options.clang_tidy {
        if !args.skip_patch {
            let plugin_dir = args.clang_plugin_dir.as_deref().ok_or_else(|| {
                BuildError::ConfigValidation(
                    "build_clang_tidy needs --clang-plugin-dir".to_string(),
                )
            })?;
            patch::import_clang_tidy(plugin_dir, source_dir, clang_tidy, runner)?;
        }
    }

    let build_dir = build_dir(source_dir);
    std::fs::create_dir_all(&build_dir)
        .with_context(|| format!("Failed to create {}", build_dir.display()))?;

    let llvm_src = source_dir.join("llvm");
    let upload_dir = env.upload_dir();
    let crash_dir = upload_dir.as_deref().filter(|_| options.assertions);
    let flags = PlatformFlags::derive(
        &target,
        is_llvm_toolchain(&toolchain.cc, &toolchain.cxx),
        &llvm_src,
        crash_dir,
    )?;

    // Without stage 1, profiles are merged with the configured llvm-profdata.
    let merges_profiles = options.pgo && options.stages >= 3 && options.skip_stages < 3;
    let llvm_profdata = if merges_profiles && options.skip_stages >= 1 {
        Some(tools::resolve_tool(&config, "llvm-profdata", &env)?)
    } else {
        None
    };

    let package = options.package_name();
    let windows_cross = target.target.is_windows() && target.cross;
    let os = target.target.os();
    let mut record = RunRecord::start(target.target.triple(), package);

    let stage = StageContext {
        target,
        env,
        toolchain,
        llvm_src,
        package_name: package.to_string(),
        build_type: options.build_type,
        assertions: options.assertions,
        targets: options.targets.clone(),
        ldflags: flags.ldflags.clone(),
    };

    let plans = pipeline::plan(&options, windows_cross);
    let mut orchestrator = Orchestrator::new(&stage, &flags, build_dir.clone(), runner)
        .llvm_profdata(llvm_profdata)
        .stop_after_profile(options.pgo && options.stages == 3);
    let result = orchestrator.run(&plans);
    record.stages = orchestrator.into_records();

    let result = result.and_then(|outcome| {
        if let Outcome::Installed {
            stage_dir,
            install_dir,
        } = &outcome
        {
            if options.clang_tidy.is_some() {
                prune::prune_to_clang_tidy(install_dir, os)?;
            }
            if !args.skip_tar {
                let name = source_dir.join(format!("{package}{ARCHIVE_SUFFIX}"));
                archive::build_tar_package(&name, stage_dir, package)?;
            }
        }
        Ok(outcome)
    });

    record.finish(match &result {
        Ok(Outcome::Installed { .. }) => "installed",
        Ok(Outcome::ProfileOnly { .. }) => "profile-only",
        Err(_) => "failed",
    });
    save_record(&record, &build_dir);
    result
}

fn save_record(record: &RunRecord, build_dir: &Path) {
    if let Err(e) = record.save(build_dir) {
        log::warn!("Could not write run record: {e:#}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exec::Invocation;
    use crate::record::RECORD_FILE;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stands in for cmake and ninja; installs an empty clang.
    #[derive(Default)]
    struct FakeRunner {
        calls: Vec<Invocation>,
        prefix: Option<PathBuf>,
        /// Extra top-level file to install.
        stray: Option<&'static str>,
    }

    impl Runner for FakeRunner {
        fn run(&mut self, inv: &Invocation) -> Result<()> {
            self.calls.push(inv.clone());
            match inv.program_name().as_str() {
                "cmake" => {
                    self.prefix = inv
                        .args
                        .iter()
                        .find_map(|a| a.strip_prefix("-DCMAKE_INSTALL_PREFIX="))
                        .map(PathBuf::from);
                }
                "ninja" => {
                    let prefix = self.prefix.clone().unwrap();
                    for file in ["bin/clang", "bin/clang++", "bin/clang-tidy", "lib/libLTO.so"] {
                        let path = prefix.join(file);
                        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                        std::fs::write(path, "").unwrap();
                    }
                    if let Some(stray) = self.stray {
                        std::fs::write(prefix.join(stray), "").unwrap();
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    fn fake_tool(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// An llvm-project checkout plus a config naming fake host tools.
    fn source_tree(extra: serde_json::Value) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("llvm-project");
        std::fs::create_dir_all(src.join("llvm")).unwrap();
        std::fs::write(src.join(SOURCE_MARKER), "").unwrap();

        let bin = tmp.path().join("host/bin");
        std::fs::create_dir_all(&bin).unwrap();
        let mut config = json!({
            "cc": fake_tool(&bin, "clang"),
            "cxx": fake_tool(&bin, "clang++"),
            "as": fake_tool(&bin, "clang"),
            "ar": fake_tool(&bin, "llvm-ar"),
            "ranlib": fake_tool(&bin, "llvm-ranlib"),
        });
        if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        let path = tmp.path().join("linux64.json");
        std::fs::write(&path, config.to_string()).unwrap();
        (tmp, path)
    }

    fn args(config: PathBuf) -> BuildArgs {
        BuildArgs {
            configs: vec![config],
            ..BuildArgs::default()
        }
    }

    fn linux() -> Host {
        Host::new("Linux", "x86_64")
    }

    #[test]
    fn test_requires_source_tree() {
        let tmp = TempDir::new().unwrap();
        let mut runner = FakeRunner::default();
        let err = run(
            &BuildArgs::default(),
            tmp.path(),
            BuildEnv::default(),
            linux(),
            &mut runner,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::NotSourceTree)
        ));
    }

    #[test]
    fn test_single_stage_build_is_packaged() {
        let (tmp, config) = source_tree(json!({"stages": 1}));
        let src = tmp.path().join("llvm-project");
        let mut runner = FakeRunner::default();

        let outcome = run(&args(config), &src, BuildEnv::default(), linux(), &mut runner).unwrap();

        assert_eq!(
            outcome,
            Outcome::Installed {
                stage_dir: src.join("build/stage1"),
                install_dir: src.join("build/stage1/clang"),
            }
        );
        assert_eq!(runner.calls.len(), 2);
        assert!(src.join("clang.tar.zst").exists());

        let record = RunRecord::load(&src.join("build")).unwrap();
        assert_eq!(record.stages.len(), 1);
        assert!(record.stages[0].is_final);
        assert_eq!(record.outcome.as_deref(), Some("installed"));
    }

    #[test]
    fn test_clang_tidy_build_is_pruned() {
        let (tmp, config) = source_tree(json!({
            "stages": 1,
            "build_clang_tidy": true,
            "build_clang_tidy_external": true,
        }));
        let src = tmp.path().join("llvm-project");
        let mut runner = FakeRunner::default();
        let build_args = BuildArgs {
            skip_tar: true,
            clang_plugin_dir: Some(PathBuf::from("/plugin")),
            ..args(config)
        };

        run(&build_args, &src, BuildEnv::default(), linux(), &mut runner).unwrap();

        let import = &runner.calls[0];
        assert_eq!(import.program_name(), "python3");
        assert_eq!(import.args.last().map(String::as_str), Some("--external"));

        let install = src.join("build/stage1/clang-tidy");
        assert!(install.join("bin/clang-tidy").exists());
        assert!(!install.join("bin/clang").exists());
        assert!(!install.join("lib/libLTO.so").exists());
        assert!(!src.join("clang-tidy.tar.zst").exists());
    }

    #[test]
    fn test_failed_prune_is_recorded() {
        let (tmp, config) = source_tree(json!({"stages": 1, "build_clang_tidy": true}));
        let src = tmp.path().join("llvm-project");
        let mut runner = FakeRunner {
            stray: Some("surprise.txt"),
            ..FakeRunner::default()
        };
        let build_args = BuildArgs {
            skip_patch: true,
            ..args(config)
        };

        let err = run(&build_args, &src, BuildEnv::default(), linux(), &mut runner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnexpectedLayout(_))
        ));

        let record = RunRecord::load(&src.join("build")).unwrap();
        assert_eq!(record.outcome.as_deref(), Some("failed"));
        assert_eq!(record.stages.len(), 1);
        assert!(!src.join("clang-tidy.tar.zst").exists());
    }

    #[test]
    fn test_clang_tidy_import_needs_plugin_dir() {
        let (tmp, config) = source_tree(json!({"build_clang_tidy": true}));
        let src = tmp.path().join("llvm-project");
        let mut runner = FakeRunner::default();

        let err = run(&args(config), &src, BuildEnv::default(), linux(), &mut runner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ConfigValidation(_))
        ));
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn test_clean_removes_build_dir() {
        let (tmp, _) = source_tree(json!({}));
        let src = tmp.path().join("llvm-project");
        std::fs::create_dir_all(src.join("build/stage1")).unwrap();

        clean(&src).unwrap();
        assert!(!src.join("build").exists());
        assert!(src.join(SOURCE_MARKER).exists());
        clean(&src).unwrap();
    }

    #[test]
    fn test_failed_run_is_recorded() {
        struct Failing;
        impl Runner for Failing {
            fn run(&mut self, inv: &Invocation) -> Result<()> {
                Err(BuildError::ExternalBuildFailure {
                    command: inv.to_string(),
                    status: "exit status: 1".to_string(),
                }
                .into())
            }
        }

        let (tmp, config) = source_tree(json!({}));
        let src = tmp.path().join("llvm-project");
        assert!(run(&args(config), &src, BuildEnv::default(), linux(), &mut Failing).is_err());

        let record: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(src.join("build").join(RECORD_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(record["outcome"], "failed");
        assert!(!src.join("clang.tar.zst").exists());
    }
}
