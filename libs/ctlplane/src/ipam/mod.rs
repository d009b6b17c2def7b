//! Address allocation against an external IPAM service.

mod client;

pub use client::IpamClient;

use std::net::IpAddr;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("invalid IPAM url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("IPAM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("IPAM rpc error ({code}): {message}")]
    Rpc { code: String, message: String },
    #[error("unexpected IPAM response: {0}")]
    InvalidResponse(String),
}

/// Allocator of prefixes and addresses within them.
#[async_trait]
pub trait Ipam: Send + Sync {
    async fn create_prefix(&self, cidr: &str) -> Result<(), IpamError>;

    /// Acquire `ip` if given, otherwise the next free address in the prefix.
    async fn acquire_ip(&self, prefix_cidr: &str, ip: Option<IpAddr>) -> Result<IpAddr, IpamError>;

    async fn release_ip(&self, prefix_cidr: &str, ip: IpAddr) -> Result<(), IpamError>;
}
