//! IPv4 name resolution.
use async_trait::async_trait;
use thiserror::Error;
use tokio::{net, time};

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resolving {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("No IPv4 address found for {0}")]
    NoIpv4(String),
    #[error("{0}")]
    General(String),
}

#[async_trait]
pub trait DomainResolver: Send + Sync + Clone + 'static {
    /// Returns the distinct IPv4 addresses of `name`, never an empty list.
    async fn resolve_ipv4(&self, name: &str, timeout: Duration) -> Result<Vec<Ipv4Addr>, Error>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Clone, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl DomainResolver for SystemResolver {
    async fn resolve_ipv4(&self, name: &str, timeout: Duration) -> Result<Vec<Ipv4Addr>, Error> {
        let lookup = net::lookup_host((name, 0));
        let addrs = time::timeout(timeout, lookup).await.map_err(|_| Error::Timeout {
            name: name.to_string(),
            timeout,
        })??;

        let mut ips: Vec<Ipv4Addr> = Vec::new();
        for addr in addrs {
            if let IpAddr::V4(ip) = addr.ip()
                && !ips.contains(&ip)
            {
                ips.push(ip);
            }
        }
        if ips.is_empty() {
            return Err(Error::NoIpv4(name.to_string()));
        }
        Ok(ips)
    }
}
