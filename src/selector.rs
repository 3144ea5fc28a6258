use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::SelectionConfig;
use crate::gossip::PeerTable;
use crate::state_machine::NodeState;

/// Picks the peer that receives a migrating workload.
pub struct NodeSelector {
    peers: watch::Receiver<PeerTable>,
    stale_after: Duration,
    /// Liveness confirmation window, `None` to trust the table as is.
    confirm: Option<Duration>,
}

impl NodeSelector {
    pub fn new(
        peers: watch::Receiver<PeerTable>,
        stale_after: Duration,
        selection: &SelectionConfig,
    ) -> Self {
        let confirm = selection
            .confirm_liveness
            .then(|| Duration::from_millis(selection.confirm_timeout_ms));
        Self {
            peers,
            stale_after,
            confirm,
        }
    }

    /// Fresh idle peers, lowest address first.
    fn idle_candidates(&self) -> Vec<IpAddr> {
        let now = Instant::now();
        self.peers
            .borrow()
            .fresh(now, self.stale_after)
            .filter(|(_, entry)| entry.status.state == Some(NodeState::Idle))
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// First non-stale peer advertising `IDLE`.
    pub fn find_available_node(&self) -> Option<IpAddr> {
        self.idle_candidates().into_iter().next()
    }

    /// Wait until `address` is heard from again, up to `timeout`.
    pub async fn confirm_available(&mut self, address: IpAddr, timeout: Duration) -> bool {
        let seen = self
            .peers
            .borrow_and_update()
            .get(&address)
            .map(|entry| entry.last_seen);
        let Some(seen) = seen else {
            return false;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.peers.changed()).await {
                Ok(Ok(())) => {
                    let table = self.peers.borrow_and_update();
                    match table.get(&address) {
                        Some(entry) if entry.last_seen > seen => return true,
                        Some(_) => {}
                        None => return false,
                    }
                }
                Ok(Err(_)) | Err(_) => return false,
            }
        }
    }

    /// The peer to migrate to, or `None` to save the workload locally.
    pub async fn select_target(&mut self) -> Option<IpAddr> {
        let Some(window) = self.confirm else {
            return self.find_available_node();
        };
        let candidates = self.idle_candidates();
        debug!("idle candidates: {candidates:?}");
        for candidate in candidates {
            if self.confirm_available(candidate, window).await {
                info!("selected {candidate}");
                return Some(candidate);
            }
            info!("{candidate} did not confirm within {window:?}");
        }
        None
    }
}
