use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors that end the orchestrator loop.
///
/// Anything that reaches this type leaves the node in an unknown
/// mid-migration state, so the main loop stops instead of retrying.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Process control error: {0}")]
    Process(#[from] ProcessError),

    #[error("Network alias error: {0}")]
    Alias(#[from] AliasError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no live process matching '{pattern}' for workload {name}")]
    NotRunning { name: String, pattern: String },

    #[error("could not resolve pid of {name} after {waited_ms}ms")]
    PidNotResolved { name: String, waited_ms: u64 },

    #[error("no checkpoint images at {0}")]
    MissingCheckpoint(PathBuf),

    #[error("checkpoint {action} exited with {code:?}")]
    Checkpoint { action: &'static str, code: Option<i32> },

    #[error("workload command is empty")]
    EmptyCommand,

    #[error("workload {name} has no known pid")]
    NoPid { name: String },

    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: nix::Error },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("ip addr {action} {address} on {interface} exited with {code:?}")]
    CommandFailed {
        action: &'static str,
        address: IpAddr,
        interface: String,
        code: Option<i32>,
    },

    #[error("no IPv4 address on interface {0}")]
    NoAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("copy of {source_path} to {target} exited with {code:?}")]
    CopyFailed {
        source_path: PathBuf,
        target: IpAddr,
        code: Option<i32>,
    },

    #[error("transfer to {target} timed out after {timeout_ms}ms")]
    TimedOut { target: IpAddr, timeout_ms: u64 },

    #[error("workload directory {0} has no parent")]
    NoParent(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sensor failures never leave the power monitor; they only switch it to the
/// "assume no power loss" mode.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unparseable reading '{raw}' from {path}")]
    Parse { path: PathBuf, raw: String },
}
