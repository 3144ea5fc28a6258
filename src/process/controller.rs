use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::WorkloadConfig;
use crate::error::ProcessError;
use crate::network::AliasManager;
use crate::state_machine::{LifecycleState, ProcessRecord};

use super::checkpoint::Checkpointer;
use super::host::ProcessHost;

const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a newly detected workload must be brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// No checkpoint: run the configured command.
    Fresh,
    /// A checkpoint is on disk (handed off by a peer or saved locally).
    Restore,
}

/// Drives one workload through start, checkpoint, restore and teardown.
///
/// Every operation either completes or returns an error; an error says
/// nothing about how much of the step ran.
pub struct ProcessController<C, H, N> {
    workload: WorkloadConfig,
    checkpointer: C,
    host: H,
    aliases: N,
}

impl<C: Checkpointer, H: ProcessHost, N: AliasManager> ProcessController<C, H, N> {
    pub fn new(workload: WorkloadConfig, checkpointer: C, host: H, aliases: N) -> Self {
        Self {
            workload,
            checkpointer,
            host,
            aliases,
        }
    }

    pub fn workload(&self) -> &WorkloadConfig {
        &self.workload
    }

    pub fn aliases(&self) -> &N {
        &self.aliases
    }

    /// Bring the workload up, dispatching on `kind` exactly once.
    pub async fn start(
        &self,
        record: &mut ProcessRecord,
        kind: LaunchKind,
    ) -> Result<(), ProcessError> {
        record.lifecycle = LifecycleState::Waiting;
        let result = match kind {
            LaunchKind::Fresh => {
                info!("running new workload {}", record.name);
                self.run(record).await
            }
            LaunchKind::Restore => {
                info!("restoring workload {}", record.name);
                self.restore(record).await
            }
        };
        if result.is_err() {
            record.lifecycle = LifecycleState::Error;
        }
        result
    }

    /// Launch a fresh instance and resolve its pid within the start timeout.
    pub async fn run(&self, record: &mut ProcessRecord) -> Result<(), ProcessError> {
        self.acquire_alias(record).await;
        self.host.launch(&self.workload).await?;

        let pid = self
            .wait_for_pid()
            .await
            .ok_or_else(|| ProcessError::PidNotResolved {
                name: record.name.clone(),
                waited_ms: self.workload.start_timeout_ms,
            })?;
        record.pid = Some(pid);
        record.lifecycle = LifecycleState::Running;
        info!("started {record}");
        Ok(())
    }

    /// Restore the dumped image set under the workload directory.
    pub async fn restore(&self, record: &mut ProcessRecord) -> Result<(), ProcessError> {
        let images = self.workload.images_path();
        if !images.is_dir() {
            return Err(ProcessError::MissingCheckpoint(images));
        }

        self.acquire_alias(record).await;
        self.checkpointer.restore(&images).await?;

        // Restored trees keep their pids from before the dump; a miss is tolerated
        // and completion falls back to a name lookup.
        record.pid = self.wait_for_pid().await;
        if record.pid.is_none() {
            warn!("restored {} but could not resolve its pid", record.name);
        }
        record.lifecycle = LifecycleState::Running;
        info!("restored {record}");
        Ok(())
    }

    /// Checkpoint the live workload into a clean image directory.
    pub async fn dump(&self, record: &mut ProcessRecord) -> Result<(), ProcessError> {
        let images = self.workload.images_path();
        match tokio::fs::remove_dir_all(&images).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&images).await?;

        let pid = self
            .host
            .find_pid(&self.workload.process_pattern)
            .ok_or_else(|| ProcessError::NotRunning {
                name: record.name.clone(),
                pattern: self.workload.process_pattern.clone(),
            })?;
        record.pid = Some(pid);
        info!("dumping {record}");

        self.checkpointer.dump(pid, &images).await?;
        record.lifecycle = LifecycleState::Dumped;
        Ok(())
    }

    /// Force-kill the workload, looking it up by pattern when no pid was recorded.
    pub fn terminate(&self, record: &mut ProcessRecord) -> Result<(), ProcessError> {
        let pid = record
            .pid
            .or_else(|| self.host.find_pid(&self.workload.process_pattern))
            .ok_or_else(|| ProcessError::NoPid {
                name: record.name.clone(),
            })?;
        self.host.kill(pid)?;
        record.lifecycle = LifecycleState::Terminated;
        Ok(())
    }

    /// Remove the workload directory, checkpoint images included.
    pub async fn delete_from_disk(&self, record: &ProcessRecord) -> Result<(), ProcessError> {
        tokio::fs::remove_dir_all(&record.working_directory).await?;
        Ok(())
    }

    /// Mark a running workload `Completed` once its process is gone.
    pub fn refresh(&self, record: &mut ProcessRecord) {
        if record.lifecycle != LifecycleState::Running {
            return;
        }
        let alive = match record.pid {
            Some(pid) => self.host.is_alive(pid),
            None => self.host.find_pid(&self.workload.process_pattern).is_some(),
        };
        if !alive {
            info!("workload {} exited", record.name);
            record.lifecycle = LifecycleState::Completed;
        }
    }

    async fn acquire_alias(&self, record: &ProcessRecord) {
        if let Err(e) = self.aliases.add_alias(record.network_alias).await {
            // Usually the alias is still bound from a previous occupancy.
            warn!("could not add alias {}: {e}", record.network_alias);
        }
    }

    async fn wait_for_pid(&self) -> Option<u32> {
        let deadline = Instant::now() + Duration::from_millis(self.workload.start_timeout_ms);
        loop {
            if let Some(pid) = self.host.find_pid(&self.workload.process_pattern) {
                return Some(pid);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(PID_POLL_INTERVAL).await;
        }
    }
}
