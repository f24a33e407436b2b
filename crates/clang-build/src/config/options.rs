//! Typed, validated build options.

use super::Config;
use crate::error::BuildError;
use crate::target::Target;
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// CMake build type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildType {
    #[default]
    Release,
    Debug,
    RelWithDebInfo,
    MinSizeRel,
}

impl BuildType {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildType::Release => "Release",
            BuildType::Debug => "Debug",
            BuildType::RelWithDebInfo => "RelWithDebInfo",
            BuildType::MinSizeRel => "MinSizeRel",
        }
    }
}

impl TryFrom<&str> for BuildType {
    type Error = BuildError;

    fn try_from(s: &str) -> Result<Self, BuildError> {
        match s {
            "Release" => Ok(BuildType::Release),
            "Debug" => Ok(BuildType::Debug),
            "RelWithDebInfo" => Ok(BuildType::RelWithDebInfo),
            "MinSizeRel" => Ok(BuildType::MinSizeRel),
            _ => Err(BuildError::ConfigValidation(
                "We only know how to do Release, Debug, RelWithDebInfo or MinSizeRel builds"
                    .to_string(),
            )),
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// clang-tidy package settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClangTidy {
    pub alpha: bool,
    pub external: bool,
}

/// Options read from the merged configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildOptions {
    pub stages: u8,
    pub skip_stages: u8,
    pub pgo: bool,
    pub build_type: BuildType,
    /// `LLVM_TARGETS_TO_BUILD` for the final stage.
    pub targets: Option<String>,
    /// Set when building the reduced clang-tidy package.
    pub clang_tidy: Option<ClangTidy>,
    pub assertions: bool,
    /// Requested target; `None` means the native one.
    pub target: Option<Target>,
    pub patches: Vec<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            stages: 2,
            skip_stages: 0,
            pgo: false,
            build_type: BuildType::Release,
            targets: None,
            clang_tidy: None,
            assertions: false,
            target: None,
            patches: Vec::new(),
        }
    }
}

impl BuildOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut options = Self::default();

        if let Some(stages) = config.get("stages") {
            options.stages = integer(stages, "stages")?;
            if !(1..=4).contains(&options.stages) {
                return Err(invalid("We only know how to build 1, 2, 3, or 4 stages."));
            }
        }

        if let Some(skip) = config.get("skip_stages") {
            // The compiler given in `cc` and friends is then the output of
            // the last skipped stage, built elsewhere.
            options.skip_stages = integer(skip, "skip_stages")?;
            if options.skip_stages >= options.stages {
                return Err(invalid("Cannot skip more stages than are built."));
            }
        }

        options.pgo = flag(config, "pgo")?;

        if let Some(build_type) = config.get_str("build_type")? {
            options.build_type = BuildType::try_from(build_type)?;
        }

        options.targets = match config.get("targets") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => {
                let names = items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .ok_or_else(|| invalid("`targets` entries must be strings"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Some(names.join(";"))
            }
            Some(_) => return Err(invalid("`targets` must be a string or a list of strings")),
        };

        if flag(config, "build_clang_tidy")? {
            options.clang_tidy = Some(ClangTidy {
                alpha: flag(config, "build_clang_tidy_alpha")?,
                external: flag(config, "build_clang_tidy_external")?,
            });
        }

        options.assertions = flag(config, "assertions")?;

        if let Some(target) = config.get_str("target")? {
            options.target = Some(target.parse()?);
        }

        if let Some(patches) = config.get("patches") {
            let Value::Array(items) = patches else {
                return Err(invalid("`patches` must be a list of paths"));
            };
            options.patches = items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(PathBuf::from)
                        .ok_or_else(|| invalid("`patches` entries must be strings"))
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(options)
    }

    /// Name of the installed package directory and archive.
    pub fn package_name(&self) -> &'static str {
        if self.clang_tidy.is_some() {
            "clang-tidy"
        } else {
            "clang"
        }
    }
}

fn invalid(msg: &str) -> anyhow::Error {
    BuildError::ConfigValidation(msg.to_string()).into()
}

fn integer(value: &Value, key: &str) -> Result<u8> {
    value
        .as_u64()
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| invalid(&format!("`{key}` must be a small non-negative integer")))
}

fn flag(config: &Config, key: &str) -> Result<bool> {
    match config.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid(&format!("Only boolean values are accepted for {key}."))),
    }
}
