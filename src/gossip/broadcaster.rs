use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::types::{SelfStatus, StatusPacket};

/// Periodically send the latest self-status snapshot until shut down.
pub(super) async fn run(
    socket: UdpSocket,
    destination: SocketAddr,
    interval: Duration,
    status: watch::Receiver<SelfStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let packet = StatusPacket::from(&*status.borrow());
                let bytes = match packet.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("could not encode status: {e}");
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&bytes, destination).await {
                    warn!("broadcast to {destination} failed: {e}");
                }
            }
        }
    }
    debug!("broadcaster stopped");
}
