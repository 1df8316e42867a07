//! The OS platform adapter (spec §1, §9): TUN management, route/firewall/DNS
//! installation, and prefs persistence are all external collaborators. Only
//! this capability-set interface lives in the core; real implementations are
//! platform glue that lives outside this crate.

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DnsConfig, FilterRule};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform: operation not supported on this adapter")]
    Unsupported,
    #[error("platform: {0}")]
    Other(String),
}

/// A single TUN write/read handle. `send` delivers a plaintext overlay
/// packet to the OS; `recv` yields the next outbound packet the OS wants
/// routed into the overlay.
#[async_trait]
pub trait TunHandle: Send + Sync {
    async fn send(&self, packet: &[u8]) -> Result<(), PlatformError>;
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, PlatformError>;
}

/// Capability set a [`crate::node_agent::NodeAgent`] is constructed with
/// (spec §9: "model the OS adapter as a capability set ... NodeAgent accepts
/// one adapter at construction; the rest of the core is platform-agnostic").
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn open_tun(&self, addresses: &[IpAddr]) -> Result<Box<dyn TunHandle>, PlatformError>;
    async fn install_routes(&self, routes: &[ipnet::IpNet]) -> Result<(), PlatformError>;
    async fn install_dns(&self, config: &DnsConfig) -> Result<(), PlatformError>;
    async fn install_firewall_rules(&self, rules: &[FilterRule]) -> Result<(), PlatformError>;
}

/// Test double that records every call instead of touching the OS.
#[derive(Default)]
pub struct NullPlatformAdapter {
    pub calls: parking_lot::Mutex<Vec<String>>,
}

pub struct NullTunHandle;

#[async_trait]
impl TunHandle for NullTunHandle {
    async fn send(&self, _packet: &[u8]) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn recv(&self, _buf: &mut [u8]) -> Result<usize, PlatformError> {
        std::future::pending().await
    }
}

#[async_trait]
impl PlatformAdapter for NullPlatformAdapter {
    async fn open_tun(&self, addresses: &[IpAddr]) -> Result<Box<dyn TunHandle>, PlatformError> {
        self.calls.lock().push(format!("open_tun({addresses:?})"));
        Ok(Box::new(NullTunHandle))
    }

    async fn install_routes(&self, routes: &[ipnet::IpNet]) -> Result<(), PlatformError> {
        self.calls.lock().push(format!("install_routes({routes:?})"));
        Ok(())
    }

    async fn install_dns(&self, config: &DnsConfig) -> Result<(), PlatformError> {
        self.calls.lock().push(format!("install_dns({} resolvers)", config.resolvers.len()));
        Ok(())
    }

    async fn install_firewall_rules(&self, rules: &[FilterRule]) -> Result<(), PlatformError> {
        self.calls.lock().push(format!("install_firewall_rules({} rules)", rules.len()));
        Ok(())
    }
}
