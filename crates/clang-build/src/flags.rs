//! Platform-specific compiler and linker flags.

use crate::target::{Os, TargetContext};
use anyhow::{Context, Result};
use std::path::Path;

/// Extra flags passed to the compilers of a stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilerFlags {
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub asmflags: Vec<String>,
}

/// Flags for every stage of a build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlatformFlags {
    /// Stage 1, built with the host toolchain.
    pub bootstrap: CompilerFlags,
    /// Stages 2 and later, built with a freshly built clang.
    pub rebuild: CompilerFlags,
    pub ldflags: Vec<String>,
}

fn strings(flags: &[&str]) -> Vec<String> {
    flags.iter().map(ToString::to_string).collect()
}

impl PlatformFlags {
    /// Derive the flags for `ctx`.
    ///
    /// `llvm_toolchain` tells whether the host compilers are clang.
    /// `crash_dir` is where clang writes crash reproducers, when wanted.
    pub fn derive(
        ctx: &TargetContext,
        llvm_toolchain: bool,
        llvm_src: &Path,
        crash_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut flags = Self::default();

        match ctx.target.os() {
            Os::Darwin => {
                // The linker flags are used by LLVM's configure step before
                // LLVM_ENABLE_LLD is processed, so the linker is named here.
                flags.ldflags = strings(&["-fuse-ld=lld", "-Wl,-dead_strip"]);
            }
            Os::Linux => {
                flags.rebuild.cflags = strings(&["-fPIC"]);
                // Silence clang's warnings about unused arguments.
                flags.rebuild.cxxflags = strings(&["-fPIC", "-Qunused-arguments"]);
                // Keep libLLVM internal calls out of the PLT.
                flags.ldflags = strings(&["-Wl,-Bsymbolic-functions"]);
                // LLVM turns on -ffunction-sections/-fdata-sections but not
                // the matching section GC, and is picky about ICF.
                if llvm_toolchain {
                    flags.ldflags.extend(strings(&["-fuse-ld=lld", "-Wl,--icf=safe"]));
                }
                flags.ldflags.push("-Wl,--gc-sections".to_string());
            }
            Os::Windows => {
                // clang-cl emulates whatever MSVC it finds; there is none,
                // so pin the version WinMsvc.cmake uses.
                let compat = ms_compatibility_flag(llvm_src)?;
                flags.rebuild.cflags = vec![compat.clone()];
                flags.rebuild.cxxflags = vec![compat];
            }
        }

        if let Some(dir) = crash_dir {
            let flag = format!("-fcrash-diagnostics-dir={}", dir.display());
            flags.rebuild.cflags.push(flag.clone());
            flags.rebuild.cxxflags.push(flag);
        }

        Ok(flags)
    }
}

/// The `-fms-compatibility-version=` flag from LLVM's WinMsvc.cmake.
fn ms_compatibility_flag(llvm_src: &Path) -> Result<String> {
    let path = llvm_src.join("cmake/platforms/WinMsvc.cmake");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    text.split_whitespace()
        .find(|item| item.contains("-fms-compatibility-version="))
        .map(ToString::to_string)
        .with_context(|| format!("No -fms-compatibility-version in {}", path.display()))
}
