//! A single configure + build + install cycle of the toolchain.

use crate::config::BuildType;
use crate::env::BuildEnv;
use crate::error::BuildError;
use crate::exec::{Invocation, Runner};
use crate::flags::CompilerFlags;
use crate::target::{is_llvm_toolchain, Target, TargetContext};
use crate::tools::Toolchain;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Compiler drivers a stage is built with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compilers {
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub asm: PathBuf,
}

impl Compilers {
    pub fn from_toolchain(toolchain: &Toolchain) -> Self {
        Self {
            cc: toolchain.cc.clone(),
            cxx: toolchain.cxx.clone(),
            asm: toolchain.asm.clone(),
        }
    }

    /// The compilers a stage installed under `install_dir`.
    pub fn installed_in(install_dir: &Path, target: Target) -> Self {
        let (cc, cxx) = target.compiler_names();
        let exe = target.exe_suffix();
        let bin = install_dir.join("bin");
        Self {
            cc: bin.join(format!("{cc}{exe}")),
            cxx: bin.join(format!("{cxx}{exe}")),
            asm: bin.join(format!("{cc}{exe}")),
        }
    }

    /// First compiler that does not exist on disk.
    pub fn missing(&self) -> Option<&Path> {
        [&self.cc, &self.cxx, &self.asm]
            .into_iter()
            .find(|p| !p.exists())
            .map(PathBuf::as_path)
    }
}

/// Profile-guided optimization role of a stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    None,
    /// Build an instrumented compiler.
    Generate,
    /// Optimize with merged profile data.
    Use(PathBuf),
}

/// Everything that differs between stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub number: u8,
    pub dir: PathBuf,
    pub compilers: Compilers,
    pub flags: CompilerFlags,
    pub is_final: bool,
    pub profile: Profile,
    /// Extra environment for this stage's commands only.
    pub env: Vec<(String, String)>,
}

impl StageSpec {
    pub fn build_dir(&self) -> PathBuf {
        self.dir.join("build")
    }

    pub fn install_dir(&self, package_name: &str) -> PathBuf {
        self.dir.join(package_name)
    }
}

/// Settings shared by every stage of a build.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub target: TargetContext,
    pub env: BuildEnv,
    pub toolchain: Toolchain,
    pub llvm_src: PathBuf,
    pub package_name: String,
    pub build_type: BuildType,
    pub assertions: bool,
    /// Backends for the final stage.
    pub targets: Option<String>,
    pub ldflags: Vec<String>,
}

/// CMake doesn't deal well with backslashes in paths.
fn slashify(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

impl StageContext {
    /// CMake cache arguments for `spec`, without the source directory.
    pub fn cmake_args(&self, spec: &StageSpec) -> Result<Vec<String>> {
        let target = self.target.target;
        let triple = target.triple();
        let cc = &spec.compilers;
        let flags = &spec.flags;
        let ldflags = self.ldflags.join(" ");
        let inst_dir = spec.install_dir(&self.package_name);

        let machine_targets = match (&self.targets, spec.is_final) {
            (Some(targets), true) => targets.clone(),
            _ => target.llvm_backend().to_string(),
        };

        let mut args = vec![
            "-GNinja".to_string(),
            format!("-DCMAKE_C_COMPILER={}", slashify(&cc.cc)),
            format!("-DCMAKE_CXX_COMPILER={}", slashify(&cc.cxx)),
            format!("-DCMAKE_ASM_COMPILER={}", slashify(&cc.asm)),
            format!("-DCMAKE_AR={}", slashify(&self.toolchain.ar)),
            format!("-DCMAKE_C_FLAGS_INIT={}", flags.cflags.join(" ")),
            format!("-DCMAKE_CXX_FLAGS_INIT={}", flags.cxxflags.join(" ")),
            format!("-DCMAKE_ASM_FLAGS_INIT={}", flags.asmflags.join(" ")),
            format!("-DCMAKE_EXE_LINKER_FLAGS_INIT={ldflags}"),
            format!("-DCMAKE_SHARED_LINKER_FLAGS_INIT={ldflags}"),
            format!("-DCMAKE_BUILD_TYPE={}", self.build_type),
            format!("-DCMAKE_INSTALL_PREFIX={}", inst_dir.display()),
            format!("-DLLVM_TARGETS_TO_BUILD={machine_targets}"),
            "-DLLVM_ENABLE_PER_TARGET_RUNTIME_DIR=OFF".to_string(),
            format!("-DLLVM_ENABLE_ASSERTIONS={}", on_off(self.assertions)),
            "-DLLVM_ENABLE_BINDINGS=OFF".to_string(),
            "-DLLVM_ENABLE_CURL=OFF".to_string(),
            "-DLLVM_INCLUDE_TESTS=OFF".to_string(),
            format!("-DLLVM_HOST_TRIPLE={triple}"),
            format!("-DCMAKE_C_COMPILER_TARGET={triple}"),
            format!("-DCMAKE_CXX_COMPILER_TARGET={triple}"),
            format!("-DCMAKE_ASM_COMPILER_TARGET={triple}"),
        ];

        if self.target.cross {
            args.push(format!("-DCMAKE_SYSTEM_NAME={}", target.os().as_str()));
        }
        if is_llvm_toolchain(&cc.cc, &cc.cxx) {
            args.push("-DLLVM_ENABLE_LLD=ON".to_string());
        }
        self.target.check_compiler(&cc.cc, &cc.cxx)?;

        if let Some(task_id) = self.env.task_id() {
            args.push(format!("-DCLANG_REPOSITORY_STRING=taskcluster-{task_id}"));
        }

        let mut projects = vec!["clang", "lld"];
        if spec.is_final {
            projects.push("clang-tools-extra");
            args.push("-DLLVM_ENABLE_LIBXML2=FORCE_ON".to_string());
        } else {
            args.push("-DLLVM_TOOL_LLI_BUILD=OFF".to_string());
        }
        args.push(format!("-DLLVM_ENABLE_PROJECTS={}", projects.join(";")));

        if target.is_linux() && spec.is_final {
            self.linux_final_args(&mut args);
        }

        if target.is_windows() {
            self.windows_args(spec, &mut args)?;
        } else {
            // libLLVM as a shared library is not supported on Windows.
            args.push("-DLLVM_LINK_LLVM_DYLIB=ON".to_string());
        }

        if let Some(ranlib) = &self.toolchain.ranlib {
            args.push(format!("-DCMAKE_RANLIB={}", slashify(ranlib)));
        }
        if let Some(libtool) = &self.toolchain.libtool {
            args.push(format!("-DCMAKE_LIBTOOL={}", slashify(libtool)));
        }

        if target.is_darwin() {
            self.darwin_args(&mut args)?;
        }

        match &spec.profile {
            Profile::None => {}
            Profile::Generate => {
                args.push("-DLLVM_BUILD_INSTRUMENTED=IR".to_string());
                args.push("-DLLVM_BUILD_RUNTIME=No".to_string());
            }
            Profile::Use(path) => {
                args.push(format!("-DLLVM_PROFDATA_FILE={}", path.display()));
            }
        }

        // LTO on both profile generation and use avoids most "function
        // control flow change detected (hash mismatch)" errors.
        if spec.profile != Profile::None && !target.is_windows() {
            args.push("-DLLVM_ENABLE_LTO=Thin".to_string());
        }

        Ok(args)
    }

    fn linux_final_args(&self, args: &mut Vec<String>) {
        let fetches = self.env.fetches_dir();

        if let Some(sysroot) = fetches.as_ref().map(|f| f.join("sysroot")) {
            if sysroot.exists() {
                args.push("-DLLVM_BINUTILS_INCDIR=/usr/include".to_string());
                args.push(format!("-DCMAKE_SYSROOT={}", sysroot.display()));
                // compiler-rt's i386 checks can't use a sysroot otherwise.
                args.push("-DCAN_TARGET_i386=1".to_string());
            }
        }
        args.push("-DLLVM_ENABLE_TERMINFO=OFF".to_string());

        if let Some(libxml2) = fetches.map(|f| f.join("libxml2")) {
            if libxml2.exists() {
                args.push("-DLIBXML2_DEFINITIONS=-DLIBXML_STATIC".to_string());
                args.push(format!(
                    "-DLIBXML2_INCLUDE_DIR={}/include/libxml2",
                    libxml2.display()
                ));
                args.push(format!("-DLIBXML2_LIBRARIES={}/lib/libxml2.a", libxml2.display()));
            }
        }
    }

    fn windows_args(&self, spec: &StageSpec, args: &mut Vec<String>) -> Result<()> {
        args.push("-DLLVM_EXPORT_SYMBOLS_FOR_PLUGINS=ON".to_string());
        args.push("-DCMAKE_MSVC_RUNTIME_LIBRARY=MultiThreaded".to_string());

        if self.target.cross {
            let vs = self
                .env
                .vs_install_dir()
                .ok_or(BuildError::MissingEnvironment("VSINSTALLDIR"))?;
            let native = spec
                .compilers
                .cc
                .parent()
                .and_then(Path::parent)
                .unwrap_or_else(|| Path::new(""));
            args.push(format!(
                "-DCMAKE_TOOLCHAIN_FILE={}/cmake/platforms/WinMsvc.cmake",
                self.llvm_src.display()
            ));
            args.push(format!("-DLLVM_NATIVE_TOOLCHAIN={}", native.display()));
            args.push(format!("-DHOST_ARCH={}", self.target.target.arch()));
            args.push(format!("-DLLVM_WINSYSROOT={}", vs.display()));
            args.push("-DLLVM_DISABLE_ASSEMBLY_FILES=ON".to_string());
        }

        if spec.is_final {
            let fetches = self
                .env
                .fetches_dir()
                .ok_or(BuildError::MissingEnvironment("MOZ_FETCHES_DIR"))?;
            args.push("-DLIBXML2_DEFINITIONS=-DLIBXML_STATIC".to_string());
            args.push(format!(
                "-DLIBXML2_INCLUDE_DIR={}/libxml2/include/libxml2",
                fetches.display()
            ));
            args.push(format!(
                "-DLIBXML2_LIBRARIES={}/libxml2/lib/libxml2s.lib",
                fetches.display()
            ));
        }
        Ok(())
    }

    fn darwin_args(&self, args: &mut Vec<String>) -> Result<()> {
        let target = self.target.target;
        let arch = if target.is_aarch64() { "arm64" } else { "x86_64" };
        let version = target.macos_deployment_target().unwrap_or_default();
        let sysroot = self
            .env
            .osx_sysroot()
            .ok_or(BuildError::MissingEnvironment("OSX_SYSROOT"))?;
        let sysroot = slashify(&sysroot);

        args.extend([
            format!("-DCMAKE_SYSTEM_VERSION={version}"),
            format!("-DCMAKE_OSX_SYSROOT={sysroot}"),
            format!("-DCMAKE_FIND_ROOT_PATH={sysroot}"),
            "-DCMAKE_FIND_ROOT_PATH_MODE_PROGRAM=NEVER".to_string(),
            "-DCMAKE_FIND_ROOT_PATH_MODE_LIBRARY=ONLY".to_string(),
            "-DCMAKE_FIND_ROOT_PATH_MODE_INCLUDE=ONLY".to_string(),
            "-DCMAKE_MACOSX_RPATH=ON".to_string(),
            format!("-DCMAKE_OSX_ARCHITECTURES={arch}"),
            format!("-DDARWIN_osx_ARCHS={arch}"),
            format!("-DDARWIN_osx_SYSROOT={sysroot}"),
        ]);
        if arch == "arm64" {
            args.push("-DDARWIN_osx_BUILTIN_ARCHS=arm64".to_string());
        }
        // The build asks xcrun for the SDK version; cross builds have none.
        args.push(format!("-DDARWIN_macosx_OVERRIDE_SDK_VERSION={version}"));
        Ok(())
    }

    /// Configure, build and install one stage. Returns its install directory.
    pub fn build(&self, spec: &StageSpec, runner: &mut dyn Runner) -> Result<PathBuf> {
        let build_dir = spec.build_dir();
        let inst_dir = spec.install_dir(&self.package_name);

        std::fs::create_dir_all(&build_dir)
            .with_context(|| format!("Failed to create {}", build_dir.display()))?;
        invalidate_cmake_cache(&build_dir)?;

        let mut cmake_args = self.cmake_args(spec)?;
        cmake_args.push(self.llvm_src.display().to_string());

        let env = self.target.child_env();
        runner.run(
            &Invocation::new("cmake", &build_dir)
                .args(cmake_args)
                .envs(&env)
                .envs(&spec.env),
        )?;
        runner.run(
            &Invocation::new("ninja", &build_dir)
                .args(["install", "-v"])
                .envs(&env)
                .envs(&spec.env),
        )?;

        // The import library of clang.exe is not installed.
        if self.target.target.is_windows() && spec.is_final {
            let lib = build_dir.join("lib/clang.lib");
            let dest = inst_dir.join("lib/clang.lib");
            std::fs::copy(&lib, &dest)
                .with_context(|| format!("Failed to copy {}", lib.display()))?;
        }

        Ok(inst_dir)
    }
}

/// A previous CMake run may have used other arguments; drop its cache so
/// the new ones take effect.
pub fn invalidate_cmake_cache(build_dir: &Path) -> Result<()> {
    let cache = build_dir.join("CMakeCache.txt");
    if cache.exists() {
        std::fs::remove_file(&cache)
            .with_context(|| format!("Failed to remove {}", cache.display()))?;
    }
    let files = build_dir.join("CMakeFiles");
    if files.exists() {
        std::fs::remove_dir_all(&files)
            .with_context(|| format!("Failed to remove {}", files.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Host;
    use tempfile::TempDir;

    fn toolchain() -> Toolchain {
        Toolchain {
            cc: PathBuf::from("/opt/clang/bin/clang"),
            cxx: PathBuf::from("/opt/clang/bin/clang++"),
            asm: PathBuf::from("/opt/clang/bin/clang"),
            ar: PathBuf::from("/opt/clang/bin/llvm-ar"),
            ranlib: Some(PathBuf::from("/opt/clang/bin/llvm-ranlib")),
            libtool: None,
        }
    }

    fn context(target: Target, env: BuildEnv) -> StageContext {
        StageContext {
            target: TargetContext::resolve(Some(target), Host::new("Linux", "x86_64")).unwrap(),
            env,
            toolchain: toolchain(),
            llvm_src: PathBuf::from("/src/llvm"),
            package_name: "clang".to_string(),
            build_type: BuildType::Release,
            assertions: false,
            targets: Some("X86;AArch64".to_string()),
            ldflags: vec!["-Wl,--gc-sections".to_string()],
        }
    }

    fn spec(number: u8, is_final: bool, profile: Profile) -> StageSpec {
        StageSpec {
            number,
            dir: PathBuf::from(format!("/build/stage{number}")),
            compilers: Compilers::from_toolchain(&toolchain()),
            flags: CompilerFlags {
                cflags: vec!["-fPIC".to_string()],
                ..CompilerFlags::default()
            },
            is_final,
            profile,
            env: Vec::new(),
        }
    }

    fn has(args: &[String], arg: &str) -> bool {
        args.iter().any(|a| a == arg)
    }

    #[test]
    fn test_intermediate_stage_args() {
        let ctx = context(Target::X86_64LinuxGnu, BuildEnv::default());
        let args = ctx.cmake_args(&spec(1, false, Profile::None)).unwrap();

        assert_eq!(args[0], "-GNinja");
        assert!(has(&args, "-DCMAKE_C_COMPILER=/opt/clang/bin/clang"));
        assert!(has(&args, "-DCMAKE_C_FLAGS_INIT=-fPIC"));
        assert!(has(&args, "-DCMAKE_EXE_LINKER_FLAGS_INIT=-Wl,--gc-sections"));
        assert!(has(&args, "-DCMAKE_INSTALL_PREFIX=/build/stage1/clang"));
        assert!(has(&args, "-DLLVM_TARGETS_TO_BUILD=X86"));
        assert!(has(&args, "-DLLVM_ENABLE_PROJECTS=clang;lld"));
        assert!(has(&args, "-DLLVM_TOOL_LLI_BUILD=OFF"));
        assert!(has(&args, "-DLLVM_ENABLE_LLD=ON"));
        assert!(has(&args, "-DLLVM_LINK_LLVM_DYLIB=ON"));
        assert!(has(&args, "-DCMAKE_RANLIB=/opt/clang/bin/llvm-ranlib"));
        assert!(!args.iter().any(|a| a.starts_with("-DCMAKE_SYSTEM_NAME")));
        assert!(!args.iter().any(|a| a.starts_with("-DLLVM_ENABLE_LTO")));
    }

    #[test]
    fn test_final_stage_args() {
        let ctx = context(
            Target::X86_64LinuxGnu,
            BuildEnv::from_vars([("TASK_ID", "abc123")]),
        );
        let args = ctx.cmake_args(&spec(2, true, Profile::None)).unwrap();

        assert!(has(&args, "-DLLVM_TARGETS_TO_BUILD=X86;AArch64"));
        assert!(has(&args, "-DLLVM_ENABLE_PROJECTS=clang;lld;clang-tools-extra"));
        assert!(has(&args, "-DLLVM_ENABLE_LIBXML2=FORCE_ON"));
        assert!(has(&args, "-DLLVM_ENABLE_TERMINFO=OFF"));
        assert!(has(&args, "-DCLANG_REPOSITORY_STRING=taskcluster-abc123"));
        assert!(!has(&args, "-DLLVM_TOOL_LLI_BUILD=OFF"));
    }

    #[test]
    fn test_linux_final_uses_fetched_sysroot() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sysroot")).unwrap();
        let ctx = context(
            Target::X86_64LinuxGnu,
            BuildEnv::from_vars([("MOZ_FETCHES_DIR", tmp.path().to_str().unwrap())]),
        );
        let args = ctx.cmake_args(&spec(2, true, Profile::None)).unwrap();

        let sysroot = format!("-DCMAKE_SYSROOT={}/sysroot", tmp.path().display());
        assert!(has(&args, &sysroot));
        assert!(has(&args, "-DCAN_TARGET_i386=1"));
        assert!(!args.iter().any(|a| a.starts_with("-DLIBXML2_LIBRARIES")));
    }

    #[test]
    fn test_profile_args() {
        let ctx = context(Target::X86_64LinuxGnu, BuildEnv::default());

        let args = ctx.cmake_args(&spec(2, false, Profile::Generate)).unwrap();
        assert!(has(&args, "-DLLVM_BUILD_INSTRUMENTED=IR"));
        assert!(has(&args, "-DLLVM_BUILD_RUNTIME=No"));
        assert!(has(&args, "-DLLVM_ENABLE_LTO=Thin"));

        let profile = Profile::Use(PathBuf::from("/build/stage3/merged.profdata"));
        let args = ctx.cmake_args(&spec(4, true, profile)).unwrap();
        assert!(has(&args, "-DLLVM_PROFDATA_FILE=/build/stage3/merged.profdata"));
        assert!(has(&args, "-DLLVM_ENABLE_LTO=Thin"));
    }

    #[test]
    fn test_windows_cross_args() {
        let ctx = context(
            Target::X86_64WindowsMsvc,
            BuildEnv::from_vars([("VSINSTALLDIR", "/vs"), ("MOZ_FETCHES_DIR", "/fetches")]),
        );
        let args = ctx
            .cmake_args(&spec(2, true, Profile::Use(PathBuf::from("/p"))))
            .unwrap();

        assert!(has(&args, "-DCMAKE_SYSTEM_NAME=Windows"));
        assert!(has(&args, "-DCMAKE_TOOLCHAIN_FILE=/src/llvm/cmake/platforms/WinMsvc.cmake"));
        assert!(has(&args, "-DLLVM_NATIVE_TOOLCHAIN=/opt/clang"));
        assert!(has(&args, "-DHOST_ARCH=x86_64"));
        assert!(has(&args, "-DLLVM_WINSYSROOT=/vs"));
        assert!(has(&args, "-DLIBXML2_LIBRARIES=/fetches/libxml2/lib/libxml2s.lib"));
        assert!(!has(&args, "-DLLVM_LINK_LLVM_DYLIB=ON"));
        assert!(!args.iter().any(|a| a.starts_with("-DLLVM_ENABLE_LTO")));
    }

    #[test]
    fn test_windows_cross_needs_vsinstalldir() {
        let ctx = context(Target::X86_64WindowsMsvc, BuildEnv::default());
        let err = ctx.cmake_args(&spec(1, false, Profile::None)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingEnvironment("VSINSTALLDIR"))
        ));
    }

    #[test]
    fn test_darwin_args() {
        let mut ctx = context(
            Target::Aarch64AppleDarwin,
            BuildEnv::from_vars([("OSX_SYSROOT", "/sdk/MacOSX.sdk")]),
        );
        ctx.toolchain.libtool = Some(PathBuf::from("/cctools/bin/libtool"));
        let args = ctx.cmake_args(&spec(1, false, Profile::None)).unwrap();

        assert!(has(&args, "-DCMAKE_SYSTEM_NAME=Darwin"));
        assert!(has(&args, "-DCMAKE_SYSTEM_VERSION=11.0"));
        assert!(has(&args, "-DCMAKE_OSX_SYSROOT=/sdk/MacOSX.sdk"));
        assert!(has(&args, "-DCMAKE_OSX_ARCHITECTURES=arm64"));
        assert!(has(&args, "-DDARWIN_osx_BUILTIN_ARCHS=arm64"));
        assert!(has(&args, "-DCMAKE_LIBTOOL=/cctools/bin/libtool"));
        assert!(has(&args, "-DLLVM_TARGETS_TO_BUILD=AArch64"));
    }

    #[test]
    fn test_backslashes_become_slashes() {
        assert_eq!(
            slashify(Path::new(r"C:\clang\bin\clang-cl.exe")),
            "C:/clang/bin/clang-cl.exe"
        );
    }

    #[test]
    fn test_installed_compilers() {
        let c = Compilers::installed_in(Path::new("/b/stage1/clang"), Target::X86_64LinuxGnu);
        assert_eq!(c.cc, PathBuf::from("/b/stage1/clang/bin/clang"));
        assert_eq!(c.cxx, PathBuf::from("/b/stage1/clang/bin/clang++"));
        assert_eq!(c.asm, c.cc);

        let w = Compilers::installed_in(Path::new("/b/stage1/clang"), Target::X86_64WindowsMsvc);
        assert_eq!(w.cxx, PathBuf::from("/b/stage1/clang/bin/clang-cl.exe"));
    }

    #[test]
    fn test_invalidate_cmake_cache() {
        let tmp = TempDir::new().unwrap();
        let build = tmp.path();
        std::fs::write(build.join("CMakeCache.txt"), "stale").unwrap();
        std::fs::create_dir_all(build.join("CMakeFiles/3.28")).unwrap();
        std::fs::write(build.join("build.ninja"), "").unwrap();

        invalidate_cmake_cache(build).unwrap();

        assert!(!build.join("CMakeCache.txt").exists());
        assert!(!build.join("CMakeFiles").exists());
        assert!(build.join("build.ninja").exists());
        // Nothing left to remove is fine.
        invalidate_cmake_cache(build).unwrap();
    }
}
