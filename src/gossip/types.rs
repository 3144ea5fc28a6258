use std::net::IpAddr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::state_machine::NodeState;

/// Schema version carried in every packet as `v`.
pub const PROTOCOL_VERSION: u32 = 1;

/// What this node advertises about itself.
///
/// Owned by the orchestrator and published as a snapshot on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfStatus {
    pub node_id: IpAddr,
    pub status: String,
    pub state: NodeState,
    pub voltage: f64,
    pub current: f64,
    /// Power sensing is off; the node only moves on operator command.
    pub manual: bool,
    pub migrate_requested: bool,
    /// Always false: nodes have no reboot transition.
    pub reboot_requested: bool,
    pub shutdown_requested: bool,
}

impl SelfStatus {
    pub fn new(node_id: IpAddr, manual: bool) -> Self {
        Self {
            node_id,
            status: "online".to_string(),
            state: NodeState::Idle,
            voltage: 0.0,
            current: 0.0,
            manual,
            migrate_requested: false,
            reboot_requested: false,
            shutdown_requested: false,
        }
    }
}

/// A status record as it travels over the wire.
///
/// Every field is optional on decode and unknown fields are ignored, so
/// nodes running different versions still understand each other. The key
/// names are the ones the monitoring front-ends already parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPacket {
    pub v: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    pub status: String,
    /// `None` for a missing or unrecognised state; such peers are never
    /// selected as targets.
    #[serde(
        deserialize_with = "lenient_state",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<NodeState>,
    pub voltage: f64,
    pub current: f64,
    pub manual: bool,
    pub migrate_cmd: bool,
    pub reboot_cmd: bool,
    pub shutdown_cmd: bool,
}

fn lenient_state<'de, D>(deserializer: D) -> Result<Option<NodeState>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok()))
}

impl From<&SelfStatus> for StatusPacket {
    fn from(status: &SelfStatus) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            ip: Some(status.node_id),
            status: status.status.clone(),
            state: Some(status.state),
            voltage: status.voltage,
            current: status.current,
            manual: status.manual,
            migrate_cmd: status.migrate_requested,
            reboot_cmd: status.reboot_requested,
            shutdown_cmd: status.shutdown_requested,
        }
    }
}

impl StatusPacket {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
