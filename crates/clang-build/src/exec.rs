//! External command execution.
//!
//! All external tools (cmake, ninja, patch, llvm-profdata, python) run
//! through [`Runner`], so the orchestration can be exercised without them.

use crate::error::BuildError;
use anyhow::{Context, Result};
use regex::bytes::Regex;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One external command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the inherited environment for this command only.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    /// File name of the program, e.g. `cmake`.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn is_cmake(&self) -> bool {
        let name = self.program_name();
        name == "cmake" || name == "cmake.exe"
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs external commands. Any unsuccessful exit is an error.
pub trait Runner {
    fn run(&mut self, invocation: &Invocation) -> Result<()>;
}

/// Runs commands on the host.
pub struct SystemRunner {
    upload_dir: Option<PathBuf>,
}

impl SystemRunner {
    /// `upload_dir` receives the CMake logs of a failed configure step.
    pub fn new(upload_dir: Option<PathBuf>) -> Self {
        Self { upload_dir }
    }

    fn command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)));
        cmd
    }

    /// CMake reports failed configure checks on stdout, so stdout is echoed
    /// and kept to find the log files it points at.
    fn run_cmake(&self, invocation: &Invocation) -> Result<()> {
        let mut child = Self::command(invocation)
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", invocation.program.display()))?;

        let mut lines = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let mut out = std::io::stdout();
            for line in BufReader::new(stdout).split(b'\n') {
                let line = line.context("Failed to read cmake output")?;
                out.write_all(&line)?;
                out.write_all(b"\n")?;
                out.flush()?;
                lines.push(line);
            }
        }

        let status = child.wait().context("Failed to wait for cmake")?;
        if status.success() {
            return Ok(());
        }

        if let Some(upload_dir) = &self.upload_dir {
            if let Err(e) = harvest_cmake_logs(&lines, upload_dir) {
                log::warn!("Could not collect CMake logs: {e:#}");
            }
        }
        Err(failure(invocation, &status.to_string()))
    }
}

impl Runner for SystemRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<()> {
        log::info!("{invocation}");
        log::debug!("  in {}", invocation.cwd.display());

        if invocation.is_cmake() {
            return self.run_cmake(invocation);
        }

        let status = Self::command(invocation)
            .status()
            .with_context(|| format!("Failed to run {}", invocation.program.display()))?;
        if !status.success() {
            return Err(failure(invocation, &status.to_string()));
        }
        Ok(())
    }
}

fn failure(invocation: &Invocation, status: &str) -> anyhow::Error {
    BuildError::ExternalBuildFailure {
        command: invocation.to_string(),
        status: status.to_string(),
    }
    .into()
}

/// Log files referenced by `See also "…"` lines of CMake output.
pub fn cmake_log_references(lines: &[Vec<u8>]) -> Result<Vec<PathBuf>> {
    let patterns = [
        Regex::new(r#"See also "(.*/CMakeOutput\.log)""#)?,
        Regex::new(r#"See also "(.*/CMakeError\.log)""#)?,
    ];

    let mut found = Vec::new();
    for re in &patterns {
        let first = lines
            .iter()
            .find_map(|line| re.captures(line).and_then(|c| c.get(1)));
        if let Some(m) = first {
            found.push(PathBuf::from(String::from_utf8_lossy(m.as_bytes()).into_owned()));
        }
    }
    Ok(found)
}

/// Copy the CMake logs a failed configure step points at into `upload_dir`.
///
/// Each log is copied on its own; one that can't be copied is skipped.
pub fn harvest_cmake_logs(lines: &[Vec<u8>], upload_dir: &Path) -> Result<Vec<PathBuf>> {
    let logs = cmake_log_references(lines)?;
    if logs.is_empty() {
        return Ok(logs);
    }

    std::fs::create_dir_all(upload_dir)
        .with_context(|| format!("Failed to create {}", upload_dir.display()))?;

    let mut copied = Vec::new();
    for log_file in logs {
        let Some(name) = log_file.file_name() else {
            continue;
        };
        let dest = upload_dir.join(name);
        if let Err(e) = std::fs::copy(&log_file, &dest) {
            log::warn!("Could not copy {}: {e}", log_file.display());
            continue;
        }
        log::info!("  Uploaded: {}", dest.display());
        copied.push(dest);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_display_joins_args() {
        let inv = Invocation::new("/usr/bin/ninja", "/tmp").args(["install", "-v"]);
        assert_eq!(inv.to_string(), "/usr/bin/ninja install -v");
        assert_eq!(inv.program_name(), "ninja");
    }

    #[test]
    fn test_cmake_log_references() {
        let lines: Vec<Vec<u8>> = vec![
            b"-- Configuring incomplete, errors occurred!".to_vec(),
            b"See also \"/b/stage1/build/CMakeFiles/CMakeOutput.log\".".to_vec(),
            b"See also \"/b/stage1/build/CMakeFiles/CMakeError.log\".".to_vec(),
        ];
        let logs = cmake_log_references(&lines).unwrap();
        assert_eq!(
            logs,
            vec![
                PathBuf::from("/b/stage1/build/CMakeFiles/CMakeOutput.log"),
                PathBuf::from("/b/stage1/build/CMakeFiles/CMakeError.log"),
            ]
        );
    }

    #[test]
    fn test_harvest_copies_logs() {
        let tmp = TempDir::new().unwrap();
        let files = tmp.path().join("build/CMakeFiles");
        std::fs::create_dir_all(&files).unwrap();
        std::fs::write(files.join("CMakeError.log"), "boom").unwrap();

        let line = format!("See also \"{}/CMakeError.log\".", files.display());
        let upload = tmp.path().join("upload");
        let copied = harvest_cmake_logs(&[line.into_bytes()], &upload).unwrap();

        assert_eq!(copied, vec![upload.join("CMakeError.log")]);
        assert_eq!(std::fs::read_to_string(&copied[0]).unwrap(), "boom");
    }

    #[test]
    fn test_harvest_without_references_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let upload = tmp.path().join("upload");
        let copied = harvest_cmake_logs(&[b"-- ok".to_vec()], &upload).unwrap();
        assert!(copied.is_empty());
        assert!(!upload.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_reports_failure() {
        let mut runner = SystemRunner::new(None);
        runner.run(&Invocation::new("true", ".")).unwrap();

        let err = runner.run(&Invocation::new("false", ".")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ExternalBuildFailure { .. })
        ));
    }

    #[test]
    fn test_harvest_skips_missing_logs() {
        let tmp = TempDir::new().unwrap();
        let files = tmp.path().join("build/CMakeFiles");
        std::fs::create_dir_all(&files).unwrap();
        std::fs::write(files.join("CMakeError.log"), "boom").unwrap();

        let lines = [
            format!("See also \"{}/CMakeOutput.log\".", files.display()).into_bytes(),
            format!("See also \"{}/CMakeError.log\".", files.display()).into_bytes(),
        ];
        let upload = tmp.path().join("upload");
        let copied = harvest_cmake_logs(&lines, &upload).unwrap();

        assert_eq!(copied, vec![upload.join("CMakeError.log")]);
        assert!(!upload.join("CMakeOutput.log").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_cmake_uploads_logs_and_still_fails() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let files = tmp.path().join("build/CMakeFiles");
        std::fs::create_dir_all(&files).unwrap();
        std::fs::write(files.join("CMakeError.log"), "boom").unwrap();

        let cmake = tmp.path().join("cmake");
        std::fs::write(
            &cmake,
            format!(
                "#!/bin/sh\n\
                 echo 'See also \"{dir}/CMakeOutput.log\".'\n\
                 echo 'See also \"{dir}/CMakeError.log\".'\n\
                 exit 1\n",
                dir = files.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&cmake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let upload = tmp.path().join("upload");
        let mut runner = SystemRunner::new(Some(upload.clone()));
        let err = runner.run(&Invocation::new(&cmake, tmp.path())).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ExternalBuildFailure { .. })
        ));
        assert_eq!(
            std::fs::read_to_string(upload.join("CMakeError.log")).unwrap(),
            "boom"
        );
        assert!(!upload.join("CMakeOutput.log").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_passes_env() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let inv = Invocation::new("sh", tmp.path())
            .args(["-c", "printf %s \"$PROFILE_TEST\" > out"])
            .envs(&[("PROFILE_TEST".to_string(), "on".to_string())]);
        SystemRunner::new(None).run(&inv).unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "on");
    }
}
