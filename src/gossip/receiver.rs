use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrIn, sockopt};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::peers::{MembershipTracker, Observation, PeerTable};
use super::types::StatusPacket;

/// Bind the gossip port on all interfaces with `SO_REUSEADDR`, so a
/// restarted node can rebind immediately.
pub(super) fn bind(port: u16) -> std::io::Result<UdpSocket> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    let address = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket::bind(fd.as_raw_fd(), &address)?;
    UdpSocket::from_std(std::net::UdpSocket::from(fd))
}

pub(super) struct ReceiverSettings {
    pub packet_size: usize,
    pub receive_timeout: Duration,
}

/// Listen for peer status packets and publish the peer table on change.
pub(super) async fn run(
    socket: UdpSocket,
    mut tracker: MembershipTracker,
    settings: ReceiverSettings,
    peers: watch::Sender<PeerTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; settings.packet_size];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = tokio::time::timeout(settings.receive_timeout, socket.recv_from(&mut buf)) => {
                let publish = match received {
                    Err(_) => {
                        let cleared = tracker.record_timeout(Instant::now());
                        if cleared {
                            info!("no peers heard from, peer table cleared");
                        }
                        cleared
                    }
                    Ok(Err(e)) => {
                        warn!("gossip receive failed: {e}");
                        false
                    }
                    Ok(Ok((len, from))) => handle_datagram(&mut tracker, &buf[..len], from),
                };
                if publish {
                    peers.send_replace(tracker.table().clone());
                }
            }
        }
    }
    debug!("receiver stopped");
}

/// Returns true when the table changed.
fn handle_datagram(tracker: &mut MembershipTracker, bytes: &[u8], from: SocketAddr) -> bool {
    let packet = match StatusPacket::decode(bytes) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("dropping malformed packet from {from}: {e}");
            return false;
        }
    };
    let before = tracker.table().len();
    match tracker.observe(packet, Instant::now()) {
        Observation::Inserted(_) => true,
        Observation::SelfIgnored => tracker.table().len() != before,
        Observation::Anonymous => {
            debug!("dropping packet without identity from {from}");
            tracker.table().len() != before
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::NodeState;
    use std::net::IpAddr;

    fn settings() -> ReceiverSettings {
        ReceiverSettings {
            packet_size: 512,
            receive_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn publishes_peers_and_ignores_noise() {
        let socket = bind(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        let local = IpAddr::from([10, 0, 0, 1]);
        let tracker = MembershipTracker::new(local, 8, Duration::from_secs(10));
        let (peers_tx, mut peers_rx) = watch::channel(PeerTable::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(socket, tracker, settings(), peers_tx, shutdown_rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = ("127.0.0.1", port);
        sender.send_to(b"not json", target).await.unwrap();
        sender
            .send_to(br#"{"ip": "10.0.0.1", "state": "IDLE"}"#, target)
            .await
            .unwrap();
        sender
            .send_to(br#"{"ip": "10.0.0.9", "state": "IDLE", "extra": [1, 2]}"#, target)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), peers_rx.changed())
            .await
            .unwrap()
            .unwrap();
        let table = peers_rx.borrow_and_update().clone();
        assert_eq!(table.len(), 1);
        let entry = table.get(&IpAddr::from([10, 0, 0, 9])).unwrap();
        assert_eq!(entry.status.state, Some(NodeState::Idle));
        assert!(table.get(&local).is_none());

        // Quiet network: eight 50 ms timeouts clear the table.
        tokio::time::timeout(Duration::from_secs(2), peers_rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(peers_rx.borrow().is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn malformed_datagram_changes_nothing() {
        let mut tracker =
            MembershipTracker::new(IpAddr::from([10, 0, 0, 1]), 8, Duration::from_secs(10));
        let from: SocketAddr = "10.0.0.5:12345".parse().unwrap();
        assert!(!handle_datagram(&mut tracker, b"{", from));
        assert!(tracker.table().is_empty());
    }
}
