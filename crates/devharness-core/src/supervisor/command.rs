//! Command line for the dev server child.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};
use crate::logging::LogLevel;
use crate::toolchain::Toolchain;

/// Directory under the workspace holding the datastore files.
pub const STORAGE_DIR: &str = "data.datastore";

/// Command-line families the harness knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Posix,
}

impl Platform {
    /// Map an OS name (as in [`std::env::consts::OS`]) to a platform.
    pub fn from_os(os: &str) -> Result<Self> {
        match os {
            "windows" => Ok(Platform::Windows),
            "linux" | "macos" | "freebsd" | "netbsd" | "openbsd" | "dragonfly" => {
                Ok(Platform::Posix)
            }
            other => Err(HarnessError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn current() -> Result<Self> {
        Self::from_os(std::env::consts::OS)
    }
}

/// Program plus arguments, ready to hand to a process builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

/// Everything that varies between child invocations.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub toolchain: &'a Toolchain,
    pub workspace: &'a Path,
    pub log_level: LogLevel,
    /// Implicit manifest first, then one per configured component.
    pub manifests: Vec<PathBuf>,
}

impl CommandSpec<'_> {
    /// Server flags shared by every platform.
    fn server_args(&self) -> Vec<OsString> {
        let mut storage = OsString::from("--storage_path=");
        storage.push(self.workspace.join(STORAGE_DIR));

        let mut args: Vec<OsString> = vec![
            self.toolchain.server.clone().into(),
            "--clear_datastore=true".into(),
            "--datastore_consistency_policy=consistent".into(),
            "--skip_sdk_update_check=true".into(),
            storage,
            format!("--log_level={}", self.log_level.child_flag()).into(),
            "--dev_appserver_log_level=debug".into(),
            "--port=0".into(),
            "--api_port=0".into(),
            "--admin_port=0".into(),
        ];
        args.extend(self.manifests.iter().map(|m| m.clone().into_os_string()));
        args
    }

    /// Build the platform-specific invocation.
    pub fn build(&self, platform: Platform) -> ChildCommand {
        let interpreter: OsString = self.toolchain.interpreter.clone().into();
        match platform {
            Platform::Windows => {
                let mut args: Vec<OsString> = vec!["/C".into(), interpreter];
                args.extend(self.server_args());
                ChildCommand {
                    program: "cmd".into(),
                    args,
                }
            }
            Platform::Posix => ChildCommand {
                program: interpreter,
                args: self.server_args(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_spec<'a>(toolchain: &'a Toolchain, workspace: &'a Path) -> CommandSpec<'a> {
        CommandSpec {
            toolchain,
            workspace,
            log_level: LogLevel::Child,
            manifests: vec![
                workspace.join("app.yaml"),
                PathBuf::from("/apps/worker/app.yaml"),
            ],
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn posix_runs_the_interpreter_directly() {
        let toolchain = Toolchain::new("/usr/bin/python2.7", "/sdk/dev_appserver.py");
        let ws = Path::new("/tmp/devharness-abc");
        let cmd = command_spec(&toolchain, ws).build(Platform::Posix);

        assert_eq!(cmd.program, OsString::from("/usr/bin/python2.7"));
        assert_eq!(
            strings(&cmd.args),
            vec![
                "/sdk/dev_appserver.py",
                "--clear_datastore=true",
                "--datastore_consistency_policy=consistent",
                "--skip_sdk_update_check=true",
                "--storage_path=/tmp/devharness-abc/data.datastore",
                "--log_level=debug",
                "--dev_appserver_log_level=debug",
                "--port=0",
                "--api_port=0",
                "--admin_port=0",
                "/tmp/devharness-abc/app.yaml",
                "/apps/worker/app.yaml",
            ]
        );
    }

    #[test]
    fn windows_goes_through_cmd() {
        let toolchain = Toolchain::new("python", "dev_appserver.py");
        let ws = Path::new("/tmp/ws");
        let cmd = command_spec(&toolchain, ws).build(Platform::Windows);

        assert_eq!(cmd.program, OsString::from("cmd"));
        let args = strings(&cmd.args);
        assert_eq!(&args[..3], &["/C", "python", "dev_appserver.py"]);
        assert!(args.contains(&"--api_port=0".to_string()));
    }

    #[test]
    fn platform_mapping() {
        assert_eq!(Platform::from_os("linux").unwrap(), Platform::Posix);
        assert_eq!(Platform::from_os("macos").unwrap(), Platform::Posix);
        assert_eq!(Platform::from_os("windows").unwrap(), Platform::Windows);
        let err = Platform::from_os("plan9").unwrap_err();
        assert!(matches!(err, HarnessError::UnsupportedPlatform(ref os) if os == "plan9"));
    }
}
