//! Platform routing abstraction.
//!
//! Defines [`RoutingBackend`], the only seam through which the controller reads
//! interface state and touches the routing table. The daemon ships a backend driving
//! the BSD network tools; tests use the stateful mocks in `routing::mocks`.
//!
//! **Limitation:** all operations are IPv4-only.

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::net::Ipv4Addr;

use crate::shell_command_ext;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("No gateway found for interface {0}")]
    NoGateway(String),
    #[error("Unable to parse `{value}`: {reason}")]
    Parse { value: String, reason: String },
    #[error("{0}")]
    General(String),
}

/// A network interface as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Human readable service name, e.g. `Wi-Fi` or `iPhone USB`.
    pub name: String,
    /// Device identifier, e.g. `en0`.
    pub device: String,
    pub mac: Option<String>,
}

/// Next hop of an installed route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Via {
    Gateway(Ipv4Addr),
    /// Directly reachable through the interface, used when no gateway is known.
    Device(String),
}

impl Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Via::Gateway(gateway) => write!(f, "gateway {gateway}"),
            Via::Device(device) => write!(f, "interface {device}"),
        }
    }
}

impl Display for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.device)
    }
}

/// Abstraction over platform interface and routing table operations.
///
/// Implementors must be cheaply cloneable, every controller instance owns a copy.
#[async_trait]
pub trait RoutingBackend: Send + Sync + Clone + 'static {
    /// Enumerate hardware interfaces in platform order.
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>, Error>;

    /// Whether the device currently holds an IPv4 address.
    async fn is_active(&self, device: &str) -> Result<bool, Error>;

    /// Gateway (router) of the device.
    async fn get_gateway(&self, device: &str) -> Result<Ipv4Addr, Error>;

    /// Install a route for `target`.
    async fn add_route(&self, target: &Ipv4Cidr, via: &Via) -> Result<(), Error>;

    /// Remove the route for `target`.
    async fn delete_route(&self, target: &Ipv4Cidr) -> Result<(), Error>;

    /// Point the default route at `gateway`.
    async fn change_default_gateway(&self, gateway: Ipv4Addr) -> Result<(), Error>;
}
