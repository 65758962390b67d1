//! Stateful mocks for the routing and resolution abstractions.
//!
//! The backend mock tracks the routing table it would have produced, so tests assert
//! on resulting state rather than on call sequences. All mocks share their state via
//! `Arc<Mutex<_>>` so clones handed to controllers stay observable.

#![cfg(test)]

use async_trait::async_trait;
use cidr::Ipv4Cidr;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::resolver::{self, DomainResolver};

use super::backend::{Error, InterfaceInfo, RoutingBackend, Via};
use super::controller::ResolvePolicy;

pub const PRIMARY_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const SECONDARY_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 20, 10, 1);

pub fn interface(name: &str, device: &str) -> InterfaceInfo {
    InterfaceInfo {
        name: name.to_string(),
        device: device.to_string(),
        mac: None,
    }
}

/// No delay between resolution attempts.
pub fn instant_policy() -> ResolvePolicy {
    ResolvePolicy {
        attempts: 3,
        delay: Duration::ZERO,
        timeout: Duration::from_millis(100),
    }
}

/// `Wi-Fi` on `en0` and `iPhone USB` on `en5`, both up with a gateway.
pub fn tethered_backend() -> MockBackend {
    let backend = MockBackend::with_interfaces(vec![
        interface("Thunderbolt Bridge", "bridge0"),
        interface("Wi-Fi", "en0"),
        interface("iPhone USB", "en5"),
    ]);
    {
        let mut state = backend.state.lock().unwrap();
        state.active.extend(["en0".to_string(), "en5".to_string()]);
        state.gateways.insert("en0".into(), PRIMARY_GATEWAY);
        state.gateways.insert("en5".into(), SECONDARY_GATEWAY);
        state.default_gateway = Some(PRIMARY_GATEWAY);
    }
    backend
}

// ============================================================================
// MockBackend
// ============================================================================

#[derive(Debug, Default)]
pub struct BackendState {
    pub interfaces: Vec<InterfaceInfo>,
    /// Devices holding an address.
    pub active: HashSet<String>,
    pub gateways: HashMap<String, Ipv4Addr>,
    pub routes: Vec<(Ipv4Cidr, Via)>,
    pub default_gateway: Option<Ipv4Addr>,
    pub added: Vec<Ipv4Cidr>,
    /// Every `add_route` call, including rejected ones.
    pub add_attempts: Vec<Ipv4Cidr>,
    pub deleted: Vec<Ipv4Cidr>,
    /// `add_route` fails for these targets.
    pub fail_targets: Vec<Ipv4Cidr>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl BackendState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
pub struct MockBackend {
    pub state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn with_interfaces(interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                interfaces,
                ..BackendState::default()
            })),
        }
    }

    /// Puts a route in place without recording it as added.
    pub fn install(&self, target: Ipv4Cidr) {
        let mut s = self.state.lock().unwrap();
        s.routes.push((target, Via::Gateway(SECONDARY_GATEWAY)));
    }

    pub fn set_active(&self, device: &str, active: bool) {
        let mut s = self.state.lock().unwrap();
        if active {
            s.active.insert(device.to_string());
        } else {
            s.active.remove(device);
        }
    }

    pub fn fail(&self, op: &str, msg: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.insert(op.to_string(), msg.to_string());
    }
}

#[async_trait]
impl RoutingBackend for MockBackend {
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("list_interfaces")?;
        Ok(s.interfaces.clone())
    }

    async fn is_active(&self, device: &str) -> Result<bool, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("is_active")?;
        Ok(s.active.contains(device))
    }

    async fn get_gateway(&self, device: &str) -> Result<Ipv4Addr, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("get_gateway")?;
        s.gateways
            .get(device)
            .copied()
            .ok_or_else(|| Error::NoGateway(device.to_string()))
    }

    async fn add_route(&self, target: &Ipv4Cidr, via: &Via) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.add_attempts.push(*target);
        s.check_fail("add_route")?;
        if s.fail_targets.contains(target) {
            return Err(Error::General(format!("cannot route {target}")));
        }
        if s.routes.iter().any(|(t, _)| t == target) {
            return Err(Error::General(format!("route already exists: {target}")));
        }
        s.routes.push((*target, via.clone()));
        s.added.push(*target);
        Ok(())
    }

    async fn delete_route(&self, target: &Ipv4Cidr) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete_route")?;
        s.deleted.push(*target);
        let before = s.routes.len();
        s.routes.retain(|(t, _)| t != target);
        if s.routes.len() == before {
            return Err(Error::General("route not found".into()));
        }
        Ok(())
    }

    async fn change_default_gateway(&self, gateway: Ipv4Addr) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("change_default_gateway")?;
        s.default_gateway = Some(gateway);
        Ok(())
    }
}

// ============================================================================
// MockResolver
// ============================================================================

#[derive(Debug, Default)]
pub struct ResolverState {
    pub answers: HashMap<String, Vec<Ipv4Addr>>,
    /// Remaining failing attempts per name before answers are returned.
    pub failures: HashMap<String, usize>,
    pub calls: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MockResolver {
    pub state: Arc<Mutex<ResolverState>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, name: &str, ips: &[Ipv4Addr]) -> Self {
        self.state
            .lock()
            .unwrap()
            .answers
            .insert(name.to_string(), ips.to_vec());
        self
    }

    pub fn fail_first(self, name: &str, attempts: usize) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(name.to_string(), attempts);
        self
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state.lock().unwrap().calls.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DomainResolver for MockResolver {
    async fn resolve_ipv4(&self, name: &str, timeout: Duration) -> Result<Vec<Ipv4Addr>, resolver::Error> {
        let mut s = self.state.lock().unwrap();
        *s.calls.entry(name.to_string()).or_default() += 1;
        if let Some(remaining) = s.failures.get_mut(name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(resolver::Error::Timeout {
                name: name.to_string(),
                timeout,
            });
        }
        s.answers
            .get(name)
            .cloned()
            .ok_or_else(|| resolver::Error::NoIpv4(name.to_string()))
    }
}
