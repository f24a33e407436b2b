//! Supported targets, host detection and cross-compilation rules.

use crate::error::BuildError;
use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Operating system family, named the way the build tools name them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Os {
    Linux,
    Windows,
    Darwin,
}

impl Os {
    /// Value for `CMAKE_SYSTEM_NAME` and comparisons with [`Host::system`].
    pub fn as_str(self) -> &'static str {
        match self {
            Os::Linux => "Linux",
            Os::Windows => "Windows",
            Os::Darwin => "Darwin",
        }
    }
}

/// A supported target triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    X86_64LinuxGnu,
    Aarch64LinuxGnu,
    X86_64WindowsMsvc,
    Aarch64WindowsMsvc,
    X86_64AppleDarwin,
    Aarch64AppleDarwin,
}

impl Target {
    /// All supported targets, in the order used to pick the native one.
    pub const ALL: [Target; 6] = [
        Target::X86_64LinuxGnu,
        Target::Aarch64LinuxGnu,
        Target::X86_64WindowsMsvc,
        Target::Aarch64WindowsMsvc,
        Target::X86_64AppleDarwin,
        Target::Aarch64AppleDarwin,
    ];

    pub fn triple(self) -> &'static str {
        match self {
            Target::X86_64LinuxGnu => "x86_64-unknown-linux-gnu",
            Target::Aarch64LinuxGnu => "aarch64-unknown-linux-gnu",
            Target::X86_64WindowsMsvc => "x86_64-pc-windows-msvc",
            Target::Aarch64WindowsMsvc => "aarch64-pc-windows-msvc",
            Target::X86_64AppleDarwin => "x86_64-apple-darwin",
            Target::Aarch64AppleDarwin => "aarch64-apple-darwin",
        }
    }

    pub fn os(self) -> Os {
        match self {
            Target::X86_64LinuxGnu | Target::Aarch64LinuxGnu => Os::Linux,
            Target::X86_64WindowsMsvc | Target::Aarch64WindowsMsvc => Os::Windows,
            Target::X86_64AppleDarwin | Target::Aarch64AppleDarwin => Os::Darwin,
        }
    }

    /// Machine name as reported by a host of that platform.
    pub fn machine(self) -> &'static str {
        match self {
            Target::X86_64LinuxGnu | Target::X86_64AppleDarwin => "x86_64",
            Target::Aarch64LinuxGnu => "aarch64",
            Target::X86_64WindowsMsvc => "AMD64",
            Target::Aarch64WindowsMsvc => "ARM64",
            Target::Aarch64AppleDarwin => "arm64",
        }
    }

    pub fn is_aarch64(self) -> bool {
        self.triple().starts_with("aarch64-")
    }

    /// Architecture prefix of the triple (`x86_64` or `aarch64`).
    pub fn arch(self) -> &'static str {
        if self.is_aarch64() {
            "aarch64"
        } else {
            "x86_64"
        }
    }

    pub fn is_linux(self) -> bool {
        self.os() == Os::Linux
    }

    pub fn is_windows(self) -> bool {
        self.os() == Os::Windows
    }

    pub fn is_darwin(self) -> bool {
        self.os() == Os::Darwin
    }

    pub fn exe_suffix(self) -> &'static str {
        if self.is_windows() {
            ".exe"
        } else {
            ""
        }
    }

    /// Default LLVM backend for intermediate stages.
    pub fn llvm_backend(self) -> &'static str {
        if self.is_aarch64() {
            "AArch64"
        } else {
            "X86"
        }
    }

    /// `MACOSX_DEPLOYMENT_TARGET` used when building for this target.
    pub fn macos_deployment_target(self) -> Option<&'static str> {
        match self {
            Target::Aarch64AppleDarwin => Some("11.0"),
            Target::X86_64AppleDarwin => Some("10.12"),
            _ => None,
        }
    }

    /// Names of the C and C++ compiler drivers a stage installs.
    pub fn compiler_names(self) -> (&'static str, &'static str) {
        if self.is_windows() {
            ("clang-cl", "clang-cl")
        } else {
            ("clang", "clang++")
        }
    }
}

impl FromStr for Target {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, BuildError> {
        Target::ALL
            .into_iter()
            .find(|t| t.triple() == s)
            .ok_or_else(|| BuildError::UnsupportedTarget(s.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.triple())
    }
}

/// The machine running the build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub system: String,
    pub machine: String,
}

impl Host {
    pub fn new(system: &str, machine: &str) -> Self {
        Self {
            system: system.to_string(),
            machine: machine.to_string(),
        }
    }

    /// Describe the running machine using the platform's own naming.
    pub fn current() -> Self {
        let arch = std::env::consts::ARCH;
        match std::env::consts::OS {
            "linux" => Self::new("Linux", arch),
            "macos" => Self::new("Darwin", if arch == "aarch64" { "arm64" } else { arch }),
            "windows" => Self::new(
                "Windows",
                match arch {
                    "x86_64" => "AMD64",
                    "aarch64" => "ARM64",
                    other => other,
                },
            ),
            other => Self::new(other, arch),
        }
    }

    fn is_linux(&self) -> bool {
        self.system == Os::Linux.as_str()
    }
}

/// Whether building for `target` on `host` is a cross-compilation.
///
/// An x86_64 mac target on an arm64 mac is not: Rosetta runs the result.
pub fn is_cross_compile(target: Target, host: &Host) -> bool {
    if host.system != target.os().as_str() {
        return true;
    }
    if host.system == Os::Darwin.as_str() && host.machine == "arm64" {
        return false;
    }
    host.machine != target.machine()
}

/// Whether both compilers belong to an LLVM toolchain.
pub fn is_llvm_toolchain(cc: &Path, cxx: &Path) -> bool {
    cc.to_string_lossy().contains("clang") && cxx.to_string_lossy().contains("clang")
}

/// A target resolved against the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetContext {
    pub target: Target,
    pub host: Host,
    /// The target the host builds for without cross-compiling.
    pub native: Target,
    pub cross: bool,
}

impl TargetContext {
    /// Resolve the requested target (or the native one) on `host`.
    pub fn resolve(requested: Option<Target>, host: Host) -> Result<Self> {
        let native = Target::ALL
            .into_iter()
            .find(|t| !is_cross_compile(*t, &host))
            .ok_or_else(|| BuildError::UnsupportedHost {
                system: host.system.clone(),
                machine: host.machine.clone(),
            })?;

        let target = requested.unwrap_or(native);
        let cross = is_cross_compile(target, &host);
        if cross && !host.is_linux() {
            return Err(BuildError::UnsupportedCrossCompile(
                "Cross-compilation is only supported on Linux".to_string(),
            )
            .into());
        }

        Ok(Self {
            target,
            host,
            native,
            cross,
        })
    }

    /// Reject compilers that cannot produce binaries for the target.
    pub fn check_compiler(&self, cc: &Path, cxx: &Path) -> Result<()> {
        if self.target.is_windows() && self.cross && !is_llvm_toolchain(cc, cxx) {
            return Err(BuildError::UnsupportedCrossCompile(
                "Cannot cross-compile for Windows with a compiler that is not clang".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Environment every child process gets for this target.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(version) = self.target.macos_deployment_target() {
            env.push(("MACOSX_DEPLOYMENT_TARGET".to_string(), version.to_string()));
        }
        if self.target.is_windows() {
            // Read by llvm/lib/DebugInfo/PDB.
            env.push((
                "VSCMD_ARG_TGT_ARCH".to_string(),
                self.target.machine().to_lowercase(),
            ));
        }
        env
    }
}
