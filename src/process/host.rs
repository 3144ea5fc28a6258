use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::debug;

use crate::config::WorkloadConfig;
use crate::error::ProcessError;

/// The OS process table, as far as the workload is concerned.
pub trait ProcessHost {
    /// Launch the workload detached from this process's lifetime.
    async fn launch(&self, workload: &WorkloadConfig) -> Result<(), ProcessError>;

    /// Newest live process whose command line contains `pattern`.
    fn find_pid(&self, pattern: &str) -> Option<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    fn kill(&self, pid: u32) -> Result<(), ProcessError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemProcessHost;

impl ProcessHost for SystemProcessHost {
    async fn launch(&self, workload: &WorkloadConfig) -> Result<(), ProcessError> {
        let (program, args) = workload
            .command
            .split_first()
            .ok_or(ProcessError::EmptyCommand)?;
        debug!("launching {program} {}", args.join(" "));

        // Own process group and null stdio: the workload outlives us.
        let child = Command::new(program)
            .args(args)
            .current_dir(&workload.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        debug!("spawned pid {:?}", child.id());
        Ok(())
    }

    fn find_pid(&self, pattern: &str) -> Option<u32> {
        let own = std::process::id();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own)
            .filter(|(_, process)| {
                process.name().to_string_lossy().contains(pattern)
                    || process
                        .cmd()
                        .iter()
                        .any(|arg| arg.to_string_lossy().contains(pattern))
            })
            .map(|(pid, _)| pid.as_u32())
            .max()
    }

    fn is_alive(&self, pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|source| ProcessError::Signal { pid, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(SystemProcessHost.is_alive(std::process::id()));
    }

    #[test]
    fn unknown_pattern_finds_nothing() {
        assert_eq!(
            SystemProcessHost.find_pid("no-such-workload-3f9c2a71"),
            None
        );
    }

    #[tokio::test]
    async fn launch_find_and_kill() {
        let tmp = tempfile::TempDir::new().unwrap();
        let workload = WorkloadConfig {
            directory: tmp.path().to_path_buf(),
            command: vec!["sleep".to_string(), "31.4159".to_string()],
            ..WorkloadConfig::default()
        };
        SystemProcessHost.launch(&workload).await.unwrap();

        let mut pid = None;
        for _ in 0..50 {
            pid = SystemProcessHost.find_pid("31.4159");
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let pid = pid.expect("sleep should be visible in the process table");
        SystemProcessHost.kill(pid).unwrap();
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let workload = WorkloadConfig {
            command: Vec::new(),
            ..WorkloadConfig::default()
        };
        assert!(matches!(
            SystemProcessHost.launch(&workload).await,
            Err(ProcessError::EmptyCommand)
        ));
    }
}
