use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::ProcessError;

/// Freezes a process tree to disk and brings it back.
pub trait Checkpointer {
    /// Dump `pid` into `images_dir`. The process does not survive a dump.
    async fn dump(&self, pid: u32, images_dir: &Path) -> Result<(), ProcessError>;

    /// Restore the tree saved in `images_dir`, detached from the caller.
    async fn restore(&self, images_dir: &Path) -> Result<(), ProcessError>;
}

/// CRIU-backed checkpointer.
///
/// Both directions keep shell-job and established TCP connections so the
/// workload's clients stay attached across the move.
#[derive(Debug, Clone)]
pub struct CriuCheckpointer {
    binary: PathBuf,
}

impl Default for CriuCheckpointer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("criu"),
        }
    }
}

impl CriuCheckpointer {
    fn dump_args(pid: u32, images_dir: &Path) -> Vec<String> {
        vec![
            "dump".to_string(),
            "-t".to_string(),
            pid.to_string(),
            "-D".to_string(),
            images_dir.display().to_string(),
            "-o".to_string(),
            "dump.log".to_string(),
            "-v4".to_string(),
            "--shell-job".to_string(),
            "--tcp-established".to_string(),
            "--ghost-limit".to_string(),
            "100000000".to_string(),
        ]
    }

    fn restore_args(images_dir: &Path) -> Vec<String> {
        vec![
            "restore".to_string(),
            "-D".to_string(),
            images_dir.display().to_string(),
            "-o".to_string(),
            "restore.log".to_string(),
            "-v4".to_string(),
            "--shell-job".to_string(),
            "--tcp-established".to_string(),
            "--restore-detached".to_string(),
        ]
    }

    async fn run(&self, action: &'static str, args: Vec<String>) -> Result<(), ProcessError> {
        debug!("{} {}", self.binary.display(), args.join(" "));
        let status = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .process_group(0)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Checkpoint {
                action,
                code: status.code(),
            })
        }
    }
}

impl Checkpointer for CriuCheckpointer {
    async fn dump(&self, pid: u32, images_dir: &Path) -> Result<(), ProcessError> {
        self.run("dump", Self::dump_args(pid, images_dir)).await
    }

    async fn restore(&self, images_dir: &Path) -> Result<(), ProcessError> {
        self.run("restore", Self::restore_args(images_dir)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_preserves_shell_job_and_tcp() {
        let args = CriuCheckpointer::dump_args(1234, Path::new("/home/pi/videoboard/checkpoint"));
        assert_eq!(&args[..5], ["dump", "-t", "1234", "-D", "/home/pi/videoboard/checkpoint"]);
        assert!(args.iter().any(|a| a == "--shell-job"));
        assert!(args.iter().any(|a| a == "--tcp-established"));
    }

    #[test]
    fn restore_is_detached() {
        let args = CriuCheckpointer::restore_args(Path::new("/tmp/images"));
        assert_eq!(args[0], "restore");
        assert!(args.iter().any(|a| a == "--restore-detached"));
        assert!(args.iter().any(|a| a == "--tcp-established"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let criu = CriuCheckpointer {
            binary: PathBuf::from("/nonexistent/criu"),
        };
        let err = criu.restore(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Io(_)));
    }
}
