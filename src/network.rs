//! Network identity of the workload.
//!
//! Clients address the workload, not the node hosting it, so the workload's
//! address is a secondary alias that follows it from node to node.

use std::net::{IpAddr, Ipv4Addr};

use nix::ifaddrs::getifaddrs;
use tokio::process::Command;
use tracing::debug;

use crate::error::AliasError;

/// Adds and removes the workload's address alias on this node.
///
/// A duplicate add or a remove of an absent alias may fail at the OS level.
pub trait AliasManager {
    async fn add_alias(&self, address: IpAddr) -> Result<(), AliasError>;
    async fn remove_alias(&self, address: IpAddr) -> Result<(), AliasError>;
}

/// `ip addr add|del <address>/<prefix> dev <interface>`.
#[derive(Debug, Clone)]
pub struct IpAliasManager {
    interface: String,
    prefix_len: u8,
}

impl IpAliasManager {
    pub fn new(interface: impl Into<String>, prefix_len: u8) -> Self {
        Self {
            interface: interface.into(),
            prefix_len,
        }
    }

    fn args(&self, action: &str, address: IpAddr) -> Vec<String> {
        vec![
            "addr".to_string(),
            action.to_string(),
            format!("{address}/{}", self.prefix_len),
            "dev".to_string(),
            self.interface.clone(),
        ]
    }

    async fn run(&self, action: &'static str, address: IpAddr) -> Result<(), AliasError> {
        let args = self.args(action, address);
        debug!("ip {}", args.join(" "));
        let status = Command::new("ip").args(&args).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(AliasError::CommandFailed {
                action,
                address,
                interface: self.interface.clone(),
                code: status.code(),
            })
        }
    }
}

impl AliasManager for IpAliasManager {
    async fn add_alias(&self, address: IpAddr) -> Result<(), AliasError> {
        self.run("add", address).await
    }

    async fn remove_alias(&self, address: IpAddr) -> Result<(), AliasError> {
        self.run("del", address).await
    }
}

/// First IPv4 address bound to `interface`, used as this node's identity.
///
/// The workload alias lives on the same interface, so it is skipped.
pub fn local_address(interface: &str, exclude: IpAddr) -> Result<IpAddr, AliasError> {
    let addrs = getifaddrs().map_err(|e| AliasError::Io(e.into()))?;
    addrs
        .filter(|ifa| ifa.interface_name == interface)
        .filter_map(|ifa| ifa.address)
        .filter_map(|addr| addr.as_sockaddr_in().map(|sin| Ipv4Addr::from(sin.ip())))
        .map(IpAddr::V4)
        .find(|ip| *ip != exclude)
        .ok_or_else(|| AliasError::NoAddress(interface.to_string()))
}
