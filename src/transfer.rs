//! Moving a checkpointed workload to a peer.
//!
//! The artifacts are copied first; the handoff marker follows only after the
//! copy succeeded, since the peer restores as soon as the marker appears.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::state_machine::ProcessRecord;

const BAR_WIDTH: i64 = 50;

/// Remote copy primitives.
pub trait ArtifactTransporter {
    /// Copy `source` recursively into `destination_dir` on `target`.
    async fn copy_tree(
        &self,
        source: &Path,
        target: IpAddr,
        destination_dir: &Path,
    ) -> Result<(), TransferError>;

    /// Create an empty file at `remote_path` on `target`.
    async fn put_marker(&self, target: IpAddr, remote_path: &Path) -> Result<(), TransferError>;
}

/// `scp` with key-based authentication. Never prompts.
#[derive(Debug, Clone)]
pub struct ScpTransporter {
    user: String,
    port: u16,
    connect_timeout_secs: u64,
    timeout: Duration,
}

impl ScpTransporter {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            user: config.user.clone(),
            port: config.ssh_port,
            connect_timeout_secs: config.connect_timeout_secs,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    fn remote(&self, target: IpAddr, path: &Path) -> String {
        match target {
            IpAddr::V4(v4) => format!("{}@{v4}:{}", self.user, path.display()),
            IpAddr::V6(v6) => format!("{}@[{v6}]:{}", self.user, path.display()),
        }
    }

    fn args(&self, source: &Path, target: IpAddr, destination: &Path) -> Vec<String> {
        vec![
            "-r".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-P".to_string(),
            self.port.to_string(),
            source.display().to_string(),
            self.remote(target, destination),
        ]
    }

    async fn scp(
        &self,
        source: &Path,
        target: IpAddr,
        destination: &Path,
    ) -> Result<(), TransferError> {
        let args = self.args(source, target, destination);
        debug!("scp {}", args.join(" "));
        let mut command = Command::new("scp");
        command.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .map_err(|_| TransferError::TimedOut {
                target,
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        if status.success() {
            Ok(())
        } else {
            Err(TransferError::CopyFailed {
                source_path: source.to_path_buf(),
                target,
                code: status.code(),
            })
        }
    }
}

impl ArtifactTransporter for ScpTransporter {
    async fn copy_tree(
        &self,
        source: &Path,
        target: IpAddr,
        destination_dir: &Path,
    ) -> Result<(), TransferError> {
        self.scp(source, target, destination_dir).await
    }

    async fn put_marker(&self, target: IpAddr, remote_path: &Path) -> Result<(), TransferError> {
        // The staged file is removed when `staged` drops.
        let staged = tempfile::NamedTempFile::new()?;
        self.scp(staged.path(), target, remote_path).await
    }
}

/// Copies a workload and signals its arrival to the peer.
pub struct TransferChannel<T> {
    transporter: T,
    handoff_marker: PathBuf,
}

impl<T: ArtifactTransporter> TransferChannel<T> {
    /// `handoff_marker` is where the marker goes on the peer; all nodes share
    /// the same state directory layout.
    pub fn new(transporter: T, handoff_marker: PathBuf) -> Self {
        Self {
            transporter,
            handoff_marker,
        }
    }

    /// Copy the workload directory to the same parent path on `target`.
    pub async fn send(
        &self,
        record: &ProcessRecord,
        target: IpAddr,
        timing: &mut TransferRecord,
    ) -> Result<(), TransferError> {
        let started = Utc::now();
        let destination = record
            .working_directory
            .parent()
            .ok_or_else(|| TransferError::NoParent(record.working_directory.clone()))?;
        info!(
            "copying {} to {target}:{}",
            record.working_directory.display(),
            destination.display()
        );
        self.transporter
            .copy_tree(&record.working_directory, target, destination)
            .await?;
        timing.push("Transfer", started);
        Ok(())
    }

    pub async fn send_completion_flag(
        &self,
        target: IpAddr,
        timing: &mut TransferRecord,
    ) -> Result<(), TransferError> {
        let started = Utc::now();
        self.transporter
            .put_marker(target, &self.handoff_marker)
            .await?;
        info!("handoff marker written on {target}");
        timing.push("Finish flag", started);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    InProgress,
    HandedOff,
    SavedLocally,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferStep {
    pub name: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransferStep {
    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Timing of one migration attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub target: Option<IpAddr>,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<TransferStep>,
    pub outcome: TransferOutcome,
}

impl TransferRecord {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            target: None,
            started_at: Utc::now(),
            steps: Vec::new(),
            outcome: TransferOutcome::InProgress,
        }
    }

    /// Record a step that began at `started_at` and ends now.
    pub fn push(&mut self, name: &'static str, started_at: DateTime<Utc>) {
        self.steps.push(TransferStep {
            name,
            started_at,
            finished_at: Utc::now(),
        });
    }

    pub fn total_ms(&self) -> i64 {
        self.steps
            .last()
            .map(|step| (step.finished_at - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }

    /// Per-step durations with a bar proportional to the total.
    pub fn render_report(&self) -> String {
        let total = self.total_ms();
        let target = self
            .target
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "local".to_string());

        let mut out = String::new();
        let _ = writeln!(out, "Migration {} ({target})", self.id);
        let _ = writeln!(out, "Time: {}", self.started_at.to_rfc3339());
        let _ = writeln!(out, "Outcome: {:?}", self.outcome);
        let _ = writeln!(out, "Migration took total of {total} ms");
        for step in &self.steps {
            let ms = step.elapsed_ms();
            let bar = if total > 0 {
                (ms * BAR_WIDTH / total).max(0) as usize
            } else {
                0
            };
            let _ = writeln!(out, "{:<15} {ms:>5} ms {}", step.name, "-".repeat(bar));
        }
        out
    }

    pub fn write_report(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render_report())
    }
}
