//! Stage planning and orchestration.
//!
//! Stages run strictly in order. Stage *k* is built with the compilers
//! stage *k-1* installed, unless stage *k-1* was skipped, in which case the
//! host toolchain from the configuration stands in for it.
//!
//! With PGO, stage 2 builds an instrumented compiler, stage 3 is built by it
//! while raw profiles are collected, and stage 4 is optimized with the
//! merged profile. A 3-stage PGO build stops after publishing the profile.

use crate::config::BuildOptions;
use crate::error::BuildError;
use crate::exec::Runner;
use crate::flags::PlatformFlags;
use crate::pgo::{self, ProfileCollection, MERGED_PROFILE};
use crate::record::StageRecord;
use crate::stage::{Compilers, Profile, StageContext, StageSpec};
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;

/// Where a stage's compilers come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilerSource {
    /// The toolchain named in the configuration.
    Host,
    /// The install tree of an earlier stage.
    Stage(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagSet {
    Bootstrap,
    Rebuild,
}

/// Where the optimizing stage finds its profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileSource {
    /// Merged in this run after stage 3.
    Merged,
    /// Fetched into `MOZ_FETCHES_DIR` from an earlier run.
    Fetched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannedProfile {
    None,
    Generate,
    Use(ProfileSource),
}

/// One stage of the plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagePlan {
    pub number: u8,
    pub compiler: CompilerSource,
    pub flags: FlagSet,
    pub profile: PlannedProfile,
    /// Raw profiles are collected while building this stage.
    pub collects_profiles: bool,
    /// Windows cross PGO: llvm-profdata can't read compressed names.
    pub disable_name_compression: bool,
    pub is_final: bool,
}

/// Plan the stages `options` asks for.
pub fn plan(options: &BuildOptions, windows_cross: bool) -> Vec<StagePlan> {
    let stages = options.stages;
    let skip = options.skip_stages;
    let pgo = options.pgo;

    (1..=stages)
        .filter(|&k| skip < k)
        .map(|k| StagePlan {
            number: k,
            compiler: if k > 1 && skip < k - 1 {
                CompilerSource::Stage(k - 1)
            } else {
                CompilerSource::Host
            },
            flags: if k == 1 {
                FlagSet::Bootstrap
            } else {
                FlagSet::Rebuild
            },
            profile: match k {
                2 if pgo => PlannedProfile::Generate,
                4 if pgo && skip == 3 => PlannedProfile::Use(ProfileSource::Fetched),
                4 if pgo => PlannedProfile::Use(ProfileSource::Merged),
                _ => PlannedProfile::None,
            },
            collects_profiles: k == 3 && pgo,
            disable_name_compression: k == 2 && pgo && windows_cross,
            is_final: match k {
                1 => stages == 1,
                2 => stages == 2 && !pgo,
                3 => stages == 3 && !pgo,
                _ => stages == 4,
            },
        })
        .collect()
}

/// A stage that finished installing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltStage {
    pub number: u8,
    pub dir: PathBuf,
    pub install_dir: PathBuf,
    pub collected_profiles: Option<ProfileCollection>,
}

/// How the run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The last stage installed the final toolchain.
    Installed { stage_dir: PathBuf, install_dir: PathBuf },
    /// Stopped after merging profiles; the profile was published.
    ProfileOnly { profile: PathBuf },
}

/// Progress through the plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Ready,
    Built(BuiltStage),
    ProfileMerged { stage: BuiltStage, profile: PathBuf },
    Finished(Outcome),
}

/// Runs a stage plan.
pub struct Orchestrator<'a> {
    stage: &'a StageContext,
    flags: &'a PlatformFlags,
    build_dir: PathBuf,
    /// Used when stage 1 did not run in this build.
    llvm_profdata: Option<PathBuf>,
    /// Publish the profile and stop instead of building further.
    stop_after_profile: bool,
    upload_dir: Option<PathBuf>,
    runner: &'a mut dyn Runner,
    built: Vec<BuiltStage>,
    merged_profile: Option<PathBuf>,
    records: Vec<StageRecord>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        stage: &'a StageContext,
        flags: &'a PlatformFlags,
        build_dir: PathBuf,
        runner: &'a mut dyn Runner,
    ) -> Self {
        let upload_dir = stage.env.upload_dir();
        Self {
            stage,
            flags,
            build_dir,
            llvm_profdata: None,
            stop_after_profile: false,
            upload_dir,
            runner,
            built: Vec::new(),
            merged_profile: None,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn llvm_profdata(mut self, path: Option<PathBuf>) -> Self {
        self.llvm_profdata = path;
        self
    }

    #[must_use]
    pub fn stop_after_profile(mut self, stop: bool) -> Self {
        self.stop_after_profile = stop;
        self
    }

    /// Timing of every stage built so far.
    #[cfg(test)]
    fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StageRecord> {
        self.records
    }

    /// Run every planned stage, in order.
    pub fn run(&mut self, plans: &[StagePlan]) -> Result<Outcome> {
        let mut pending = plans.iter();
        let mut state = PipelineState::Ready;

        loop {
            state = match state {
                PipelineState::Finished(outcome) => return Ok(outcome),
                PipelineState::Built(stage) if stage.collected_profiles.is_some() => {
                    self.merge_profiles(stage)?
                }
                PipelineState::ProfileMerged { profile, .. } if self.stop_after_profile => {
                    let published = pgo::publish(&profile, self.upload_dir.as_deref())?;
                    PipelineState::Finished(Outcome::ProfileOnly { profile: published })
                }
                current => match pending.next() {
                    Some(plan) => PipelineState::Built(self.build_stage(plan)?),
                    None => PipelineState::Finished(Self::finish(current)?),
                },
            };
        }
    }

    fn finish(state: PipelineState) -> Result<Outcome> {
        match state {
            PipelineState::Built(stage) | PipelineState::ProfileMerged { stage, .. } => {
                Ok(Outcome::Installed {
                    stage_dir: stage.dir,
                    install_dir: stage.install_dir,
                })
            }
            PipelineState::Ready => Err(BuildError::ConfigValidation(
                "no stage left to build".to_string(),
            )
            .into()),
            PipelineState::Finished(outcome) => Ok(outcome),
        }
    }

    fn stage_dir(&self, number: u8) -> PathBuf {
        self.build_dir.join(format!("stage{number}"))
    }

    fn built(&self, number: u8) -> Option<&BuiltStage> {
        self.built.iter().find(|s| s.number == number)
    }

    /// Turn a plan into a concrete stage, checking that its inputs exist.
    pub fn spec_for(&self, plan: &StagePlan) -> Result<StageSpec> {
        let target = self.stage.target.target;

        let compilers = match plan.compiler {
            CompilerSource::Host => Compilers::from_toolchain(&self.stage.toolchain),
            CompilerSource::Stage(n) => {
                let install_dir = self
                    .built(n)
                    .map(|s| s.install_dir.clone())
                    .unwrap_or_else(|| self.stage_dir(n).join(&self.stage.package_name));
                let compilers = Compilers::installed_in(&install_dir, target);
                if let Some(missing) = compilers.missing() {
                    return Err(BuildError::MissingArtifact {
                        stage: plan.number,
                        path: missing.to_path_buf(),
                    }
                    .into());
                }
                compilers
            }
        };

        let mut flags = match plan.flags {
            FlagSet::Bootstrap => self.flags.bootstrap.clone(),
            FlagSet::Rebuild => self.flags.rebuild.clone(),
        };
        if plan.disable_name_compression {
            for list in [&mut flags.cflags, &mut flags.cxxflags] {
                list.push("-mllvm".to_string());
                list.push("--enable-name-compression=false".to_string());
            }
        }

        let profile = match plan.profile {
            PlannedProfile::None => Profile::None,
            PlannedProfile::Generate => Profile::Generate,
            PlannedProfile::Use(source) => {
                let path = match source {
                    ProfileSource::Merged => self
                        .merged_profile
                        .clone()
                        .unwrap_or_else(|| self.stage_dir(3).join(MERGED_PROFILE)),
                    ProfileSource::Fetched => self
                        .stage
                        .env
                        .fetches_dir()
                        .ok_or(BuildError::MissingEnvironment("MOZ_FETCHES_DIR"))?
                        .join(MERGED_PROFILE),
                };
                if !path.exists() {
                    return Err(BuildError::MissingArtifact {
                        stage: plan.number,
                        path,
                    }
                    .into());
                }
                Profile::Use(path)
            }
        };

        Ok(StageSpec {
            number: plan.number,
            dir: self.stage_dir(plan.number),
            compilers,
            flags,
            is_final: plan.is_final,
            profile,
            env: Vec::new(),
        })
    }

    fn build_stage(&mut self, plan: &StagePlan) -> Result<BuiltStage> {
        log::info!("=== Building stage {} ===", plan.number);
        let started_at = Utc::now();

        let mut spec = self.spec_for(plan)?;
        let collection = if plan.collects_profiles {
            let profiles = ProfileCollection::create(self.build_dir.join("profiles"))?;
            spec.env.extend(profiles.env());
            Some(profiles)
        } else {
            None
        };

        let install_dir = self.stage.build(&spec, &mut *self.runner)?;

        self.records.push(StageRecord {
            number: plan.number,
            is_final: plan.is_final,
            profile: match &spec.profile {
                Profile::None => "none".to_string(),
                Profile::Generate => "generate".to_string(),
                Profile::Use(path) => format!("use {}", path.display()),
            },
            started_at,
            finished_at: Utc::now(),
        });
        log::info!("  Installed: {}", install_dir.display());

        let built = BuiltStage {
            number: plan.number,
            dir: spec.dir,
            install_dir,
            collected_profiles: collection,
        };
        self.built.push(built.clone());
        Ok(built)
    }

    fn merge_profiles(&mut self, stage: BuiltStage) -> Result<PipelineState> {
        let Some(profiles) = &stage.collected_profiles else {
            return Ok(PipelineState::Built(stage));
        };

        let llvm_profdata = match self.built(1) {
            Some(stage1) => {
                let exe = self.stage.target.target.exe_suffix();
                stage1.install_dir.join(format!("bin/llvm-profdata{exe}"))
            }
            None => self.llvm_profdata.clone().ok_or_else(|| {
                BuildError::ToolNotFound("llvm-profdata not found on PATH".to_string())
            })?,
        };

        let profile = profiles.merge(&llvm_profdata, &stage.dir, &mut *self.runner)?;
        self.merged_profile = Some(profile.clone());
        Ok(PipelineState::ProfileMerged { stage, profile })
    }
}
