//! Snapshot of the environment the build reads.
//!
//! The process environment is read once at start-up. Nothing in the build
//! writes to it; variables meant for child processes are passed on each
//! command instead (see [`crate::exec::Invocation::env`]).

use crate::error::BuildError;
use anyhow::Result;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Clone, Debug, Default)]
pub struct BuildEnv {
    vars: BTreeMap<String, String>,
}

impl BuildEnv {
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.var(name).filter(|v| !v.is_empty()).map(PathBuf::from)
    }

    /// Where crash reports, CMake logs and profiles are published.
    pub fn upload_dir(&self) -> Option<PathBuf> {
        self.path("UPLOAD_DIR")
    }

    /// Directory holding fetched dependencies (sysroots, libxml2, profiles).
    pub fn fetches_dir(&self) -> Option<PathBuf> {
        self.path("MOZ_FETCHES_DIR")
    }

    pub fn task_id(&self) -> Option<&str> {
        self.var("TASK_ID")
    }

    pub fn vs_install_dir(&self) -> Option<PathBuf> {
        self.path("VSINSTALLDIR")
    }

    pub fn osx_sysroot(&self) -> Option<PathBuf> {
        self.path("OSX_SYSROOT")
    }

    /// Replace `{NAME}` references with environment values.
    pub fn expand(&self, template: &str) -> Result<String> {
        let re = Regex::new(r"\{(\w+)\}")?;

        let mut missing = None;
        let expanded = re.replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            match self.var(name) {
                Some(value) => value.to_string(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });

        if let Some(name) = missing {
            return Err(BuildError::ConfigValidation(format!(
                "`{template}` refers to {name}, which is not set"
            ))
            .into());
        }
        Ok(expanded.into_owned())
    }
}
