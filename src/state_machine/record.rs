use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::WorkloadConfig;

/// Lifecycle of the workload process as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    None,
    Waiting,
    Running,
    Dumped,
    Terminated,
    Completed,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::None => "NONE",
            LifecycleState::Waiting => "WAITING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Dumped => "DUMPED",
            LifecycleState::Terminated => "TERMINATED",
            LifecycleState::Completed => "COMPLETED",
            LifecycleState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The single workload occupying this node.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub name: String,
    pub working_directory: PathBuf,
    pub network_alias: IpAddr,
    pub pid: Option<u32>,
    pub lifecycle: LifecycleState,
}

impl ProcessRecord {
    pub fn new(workload: &WorkloadConfig) -> Self {
        Self {
            name: workload.name.clone(),
            working_directory: workload.directory.clone(),
            network_alias: workload.alias,
            pid: None,
            lifecycle: LifecycleState::None,
        }
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pid = self
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{} <dir {}, pid {pid}, alias {}, {}>",
            self.name,
            self.working_directory.display(),
            self.network_alias,
            self.lifecycle
        )
    }
}
