use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The four states of a node.
///
/// Initial state is `Idle`. Only `Idle` accepts new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "MIGRATING")]
    Migrating,
    #[serde(rename = "SHUTDOWN")]
    ShuttingDown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Idle => write!(f, "IDLE"),
            NodeState::Busy => write!(f, "BUSY"),
            NodeState::Migrating => write!(f, "MIGRATING"),
            NodeState::ShuttingDown => write!(f, "SHUTDOWN"),
        }
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(NodeState::Idle),
            "BUSY" => Ok(NodeState::Busy),
            "MIGRATING" => Ok(NodeState::Migrating),
            "SHUTDOWN" => Ok(NodeState::ShuttingDown),
            other => Err(format!("unknown node state: {other}")),
        }
    }
}

/// Events the orchestrator feeds into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Windowed voltage below the shutdown threshold.
    PowerCritical,
    /// Windowed voltage below the migrate threshold.
    PowerLow,
    MigrateCommand,
    ShutdownCommand,
    ResumeIdleCommand,
    WorkloadStarted,
    WorkloadCompleted,
    /// The migration pipeline ran to the end (hand-off or local save).
    MigrationFinished,
}

/// The result of evaluating a trigger against a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    Next(NodeState),
    /// The trigger is not defined for the current state.
    Stay,
}

/// Pure transition table for [`NodeState`].
pub struct StateMachine;

impl StateMachine {
    /// Compute the transition for `trigger` in `state`.
    ///
    /// - `Idle` and `Busy` react to power loss and to the migrate command.
    ///   Critical power skips migration and goes straight to `ShuttingDown`;
    ///   the orchestrator kills a running workload first.
    /// - `Migrating` is one-shot: it only leaves through `MigrationFinished`.
    /// - `ShuttingDown` only leaves on an explicit resume-idle command.
    pub fn next(state: NodeState, trigger: Trigger) -> Transition {
        use NodeState::*;
        use Trigger::*;

        match (state, trigger) {
            (Idle | Busy, PowerCritical) => Transition::Next(ShuttingDown),
            (Idle | Busy, PowerLow | MigrateCommand) => Transition::Next(Migrating),
            (Idle, WorkloadStarted) => Transition::Next(Busy),
            (Idle, ShutdownCommand) => Transition::Next(ShuttingDown),
            (Busy, WorkloadCompleted) => Transition::Next(Idle),
            (Migrating, MigrationFinished) => Transition::Next(ShuttingDown),
            (ShuttingDown, ResumeIdleCommand) => Transition::Next(Idle),
            _ => Transition::Stay,
        }
    }
}
