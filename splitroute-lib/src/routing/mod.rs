//! Split-tunnel routing between a primary uplink and a secondary (tethered) uplink.
//!
//! [`controller::RouteController`] runs one apply or clear cycle against a snapshot of
//! the detected interfaces. The platform specifics live behind
//! [`backend::RoutingBackend`]; name resolution behind [`crate::resolver::DomainResolver`].
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};

pub mod backend;
pub mod controller;
pub mod store;

#[cfg(test)]
pub(crate) mod mocks;

pub use backend::{InterfaceInfo, RoutingBackend, Via};
pub use controller::{InterfaceStatus, ResolvePolicy, Resolution, RouteController};
pub use store::{RoutingTargetSet, TargetStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not find {role} interface (keywords: {keywords})")]
    InterfaceNotFound { role: Role, keywords: String },
    #[error("no routes to apply (no CIDRs and no resolved IPs)")]
    NoRoutesToApply,
    #[error("no domains resolved ({total} configured) - check network connectivity")]
    NoDomainsResolved { total: usize },
    #[error("routes are not applied")]
    NotApplied,
    #[error(transparent)]
    Backend(#[from] backend::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// The two monitored interface roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// General purpose uplink, owner of the default route.
    Primary,
    /// Tethered uplink carrying the routed targets.
    Secondary,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Renders a route target with an explicit prefix length, e.g. `93.184.216.34/32`.
pub fn target_string(target: &Ipv4Cidr) -> String {
    format!("{}/{}", target.first_address(), target.network_length())
}
