//! File markers in the node's state directory.
//!
//! Operators and peers talk to the orchestrator by creating empty files.
//! Each marker is edge-triggered: it is deleted when observed so one file
//! means one command.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::process::LaunchKind;

/// Commands an operator can drop into the state directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Migrate,
    Shutdown,
    ResumeIdle,
}

#[derive(Debug, Clone)]
pub struct Markers {
    start: PathBuf,
    handoff: PathBuf,
    resume: PathBuf,
    migrate: PathBuf,
    shutdown: PathBuf,
    idle: PathBuf,
    report: PathBuf,
}

impl Markers {
    pub fn from_config(config: &NodeConfig) -> Self {
        let dir = &config.node.state_dir;
        let names = &config.markers;
        Self {
            start: dir.join(&names.start),
            handoff: dir.join(&names.handoff),
            resume: dir.join(&names.resume),
            migrate: dir.join(&names.migrate),
            shutdown: dir.join(&names.shutdown),
            idle: dir.join(&names.idle),
            report: dir.join(&names.report),
        }
    }

    /// Consume the marker for `command`, if present.
    pub fn take_command(&self, command: OperatorCommand) -> bool {
        let path = match command {
            OperatorCommand::Migrate => &self.migrate,
            OperatorCommand::Shutdown => &self.shutdown,
            OperatorCommand::ResumeIdle => &self.idle,
        };
        let taken = consume(path);
        if taken {
            info!("operator command {command:?}");
        }
        taken
    }

    /// Decide how to bring up newly arrived work, consuming its marker.
    ///
    /// A checkpoint (handed off by a peer or saved locally) wins over a
    /// fresh start when both are present.
    pub fn poll_work(&self) -> Option<LaunchKind> {
        let handoff = consume(&self.handoff);
        let resume = consume(&self.resume);
        if handoff || resume {
            if handoff {
                info!("checkpoint handed off by a peer");
            } else {
                info!("resuming locally saved checkpoint");
            }
            // A start marker alongside a checkpoint is superseded.
            consume(&self.start);
            return Some(LaunchKind::Restore);
        }
        consume(&self.start).then_some(LaunchKind::Fresh)
    }

    /// Leave a note for the next boot that a checkpoint is waiting locally.
    pub fn write_resume_marker(&self) -> io::Result<()> {
        touch(&self.resume)
    }

    pub fn report_path(&self) -> &Path {
        &self.report
    }

    /// Remote location of the handoff marker, relative to the same state
    /// directory layout on the peer.
    pub fn handoff_path(&self) -> &Path {
        &self.handoff
    }
}

fn consume(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("could not consume marker {}: {e}", path.display());
            false
        }
    }
}

fn touch(path: &Path) -> io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn markers_in(dir: &Path) -> Markers {
        let mut config = NodeConfig::default();
        config.node.state_dir = dir.to_path_buf();
        Markers::from_config(&config)
    }

    #[test]
    fn command_marker_is_edge_triggered() {
        let tmp = TempDir::new().unwrap();
        let markers = markers_in(tmp.path());
        std::fs::write(tmp.path().join("force_migrate.txt"), b"").unwrap();

        assert!(markers.take_command(OperatorCommand::Migrate));
        assert!(!markers.take_command(OperatorCommand::Migrate));
        assert!(!tmp.path().join("force_migrate.txt").exists());
    }

    #[test]
    fn commands_do_not_cross() {
        let tmp = TempDir::new().unwrap();
        let markers = markers_in(tmp.path());
        std::fs::write(tmp.path().join("force_shutdown.txt"), b"").unwrap();

        assert!(!markers.take_command(OperatorCommand::ResumeIdle));
        assert!(markers.take_command(OperatorCommand::Shutdown));
    }

    #[test]
    fn no_markers_means_no_work() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(markers_in(tmp.path()).poll_work(), None);
    }

    #[test]
    fn start_marker_is_a_fresh_launch() {
        let tmp = TempDir::new().unwrap();
        let markers = markers_in(tmp.path());
        std::fs::write(tmp.path().join("startflag.txt"), b"").unwrap();

        assert_eq!(markers.poll_work(), Some(LaunchKind::Fresh));
        assert_eq!(markers.poll_work(), None);
    }

    #[test]
    fn handoff_marker_is_a_restore() {
        let tmp = TempDir::new().unwrap();
        let markers = markers_in(tmp.path());
        std::fs::write(tmp.path().join("cpflag.txt"), b"").unwrap();
        std::fs::write(tmp.path().join("startflag.txt"), b"").unwrap();

        assert_eq!(markers.poll_work(), Some(LaunchKind::Restore));
        assert!(!tmp.path().join("startflag.txt").exists());
        assert_eq!(markers.poll_work(), None);
    }

    #[test]
    fn resume_marker_round_trip() {
        let tmp = TempDir::new().unwrap();
        let markers = markers_in(tmp.path());

        markers.write_resume_marker().unwrap();
        assert!(tmp.path().join("resume_on_boot.txt").exists());

        assert_eq!(markers.poll_work(), Some(LaunchKind::Restore));
        assert!(!tmp.path().join("resume_on_boot.txt").exists());
    }

    #[test]
    fn report_lives_in_state_dir() {
        let tmp = TempDir::new().unwrap();
        let markers = markers_in(tmp.path());
        assert_eq!(markers.report_path(), tmp.path().join("migrate_stats.txt"));
        assert_eq!(markers.handoff_path(), tmp.path().join("cpflag.txt"));
    }
}
