//! Peer status gossip over UDP broadcast.
//!
//! Two background tasks: the broadcaster advertises this node's
//! [`SelfStatus`] and the receiver maintains the [`PeerTable`]. Both talk to
//! the rest of the node through `watch` channels only.

mod broadcaster;
mod peers;
mod receiver;
mod types;

pub use peers::{MembershipTracker, PeerTable};
pub use types::SelfStatus;
#[cfg(test)]
pub use types::StatusPacket;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::GossipConfig;

pub struct GossipService {
    shutdown: watch::Sender<bool>,
    broadcaster: JoinHandle<()>,
    receiver: JoinHandle<()>,
    #[cfg(test)]
    listen_port: u16,
}

impl GossipService {
    /// Bind both sockets and spawn the two tasks.
    ///
    /// Returns the service handle and the receiving end of the peer table.
    pub async fn start(
        config: &GossipConfig,
        local: IpAddr,
        status: watch::Receiver<SelfStatus>,
    ) -> std::io::Result<(Self, watch::Receiver<PeerTable>)> {
        let listen = receiver::bind(config.port)?;
        let listen_port = listen.local_addr()?.port();

        let send = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
        send.set_broadcast(true)?;
        let destination = SocketAddr::new(config.broadcast_address, config.port);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (peers_tx, peers_rx) = watch::channel(PeerTable::default());

        let broadcaster = tokio::spawn(broadcaster::run(
            send,
            destination,
            Duration::from_millis(config.broadcast_interval_ms),
            status,
            shutdown_rx.clone(),
        ));
        let receiver = tokio::spawn(receiver::run(
            listen,
            MembershipTracker::new(local, config.max_consecutive_timeouts, config.stale_after()),
            receiver::ReceiverSettings {
                packet_size: config.packet_size,
                receive_timeout: Duration::from_millis(config.receive_timeout_ms),
            },
            peers_tx,
            shutdown_rx,
        ));

        info!("gossip up as {local}, listening on {listen_port}, broadcasting to {destination}");
        Ok((
            Self {
                shutdown,
                broadcaster,
                receiver,
                #[cfg(test)]
                listen_port,
            },
            peers_rx,
        ))
    }

    #[cfg(test)]
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Signal both tasks and wait up to `grace` for each.
    pub async fn stop(self, grace: Duration) {
        self.shutdown.send_replace(true);
        join_or_abort("broadcaster", self.broadcaster, grace).await;
        join_or_abort("receiver", self.receiver, grace).await;
        info!("gossip stopped");
    }
}

async fn join_or_abort(name: &str, mut task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{name} task failed: {e}"),
        Err(_) => {
            warn!("{name} did not stop within {grace:?}, aborting");
            task.abort();
        }
    }
}
