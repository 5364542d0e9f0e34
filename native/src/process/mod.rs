//! Child process launch and lifetime tracking.

mod handle;

pub use handle::{spawn_exit_watcher, ProcessHandle, ShutdownOutcome};

use log::{info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};
use crate::security::Identity;
use crate::sys::{self, ProcessGroup};

/// The operations the controller needs from a running child.
pub trait ChildProcess: Send {
    fn id(&self) -> u32;
    /// Exit code once the child has terminated.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    fn kill(&mut self) -> io::Result<()>;
}

impl ChildProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Child::try_wait(self)?.map(exit_code))
    }

    fn kill(&mut self) -> io::Result<()> {
        match Child::kill(self) {
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Executable, final argument list and working directory of the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
}

impl LaunchSpec {
    /// Caller arguments followed by the console switch and the instance switch.
    pub fn new(
        executable: &Path,
        arguments: &[String],
        config: &SessionConfig,
        instance_name: &str,
    ) -> Self {
        let mut final_arguments = arguments.to_vec();
        final_arguments.push(config.console_switch.clone());
        final_arguments.push(format!("{}={}", config.instance_switch, instance_name));

        let working_directory = config
            .working_directory
            .clone()
            .or_else(|| {
                executable
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(Path::to_path_buf)
            })
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            executable: executable.to_path_buf(),
            arguments: final_arguments,
            working_directory,
        }
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.arguments)
            .current_dir(&self.working_directory)
            .stdin(Stdio::null());
        command
    }
}

/// Account to run the child as.
pub struct RunAs<'a> {
    pub identity: &'a Identity,
    pub password: Option<&'a str>,
}

pub fn spawn_child(
    spec: &LaunchSpec,
    run_as: Option<RunAs<'_>>,
    group: Option<&ProcessGroup>,
) -> Result<Box<dyn ChildProcess>> {
    let executable = spec.executable.display().to_string();
    info!(
        "[PROCESS] Starting {} {} in {:?}",
        executable,
        spec.arguments.join(" "),
        spec.working_directory
    );

    let spawned = match run_as {
        Some(run_as) => {
            info!("[PROCESS] Running as {}", run_as.identity.account);
            sys::spawn_as_user(spec, group, run_as.identity, run_as.password)
        }
        None => {
            let mut command = spec.command();
            if let Some(group) = group {
                group.prepare(&mut command);
            }
            command
                .spawn()
                .map(|child| Box::new(child) as Box<dyn ChildProcess>)
        }
    };
    let mut child = spawned.map_err(|e| BridgeError::Spawn {
        executable: executable.clone(),
        reason: e.to_string(),
    })?;

    if let Some(group) = group {
        if let Err(e) = group.assign(child.id()) {
            warn!("[PROCESS] Killing {} after failed group assignment", child.id());
            let _ = child.kill();
            return Err(e);
        }
    }

    info!("[PROCESS] Started {} with pid {}", executable, child.id());
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_appends_switches() {
        let config = SessionConfig {
            console_switch: "/console".to_string(),
            instance_switch: "/consoleinstance".to_string(),
            ..SessionConfig::default()
        };
        let spec = LaunchSpec::new(
            Path::new("/opt/tool/bin/tool"),
            &["/ini=nul".to_string()],
            &config,
            "_42_abc_7",
        );
        assert_eq!(
            spec.arguments,
            vec!["/ini=nul", "/console", "/consoleinstance=_42_abc_7"]
        );
        assert_eq!(spec.working_directory, PathBuf::from("/opt/tool/bin"));
    }

    #[test]
    fn test_launch_spec_working_directory_override() {
        let config = SessionConfig {
            working_directory: Some(PathBuf::from("/srv/work")),
            ..SessionConfig::default()
        };
        let spec = LaunchSpec::new(Path::new("tool"), &[], &config, "_1_a_2");
        assert_eq!(spec.working_directory, PathBuf::from("/srv/work"));
    }

    #[test]
    fn test_bare_executable_runs_in_current_directory() {
        let spec = LaunchSpec::new(Path::new("tool"), &[], &SessionConfig::default(), "_1_a_2");
        assert_eq!(spec.working_directory, PathBuf::from("."));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_missing_executable() {
        let spec = LaunchSpec::new(
            Path::new("/nonexistent/console-bridge-child"),
            &[],
            &SessionConfig {
                working_directory: Some(std::env::temp_dir()),
                ..SessionConfig::default()
            },
            "_1_a_2",
        );
        let err = spawn_child(&spec, None, None).err().expect("spawn fails");
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_reports_exit_code() {
        let spec = LaunchSpec {
            executable: PathBuf::from("/bin/sh"),
            arguments: vec!["-c".to_string(), "exit 3".to_string()],
            working_directory: std::env::temp_dir(),
        };
        let mut child = spawn_child(&spec, None, None).expect("spawn sh");
        let code = loop {
            if let Some(code) = child.try_wait().expect("try_wait") {
                break code;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert_eq!(code, 3);
    }
}
