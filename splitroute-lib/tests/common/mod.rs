use async_trait::async_trait;
use cidr::Ipv4Cidr;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use splitroute_lib::resolver::{self, DomainResolver};
use splitroute_lib::routing::backend::Error;
use splitroute_lib::routing::{InterfaceInfo, RoutingBackend, Via};

pub const PRIMARY_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const SECONDARY_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 20, 10, 1);

/// Routing table of a machine with `Wi-Fi` on `en0` and a tethered phone on `en5`.
#[derive(Debug)]
pub struct Table {
    pub secondary_up: bool,
    pub routes: Vec<(Ipv4Cidr, Via)>,
    pub default_gateway: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct FakeBackend {
    pub table: Arc<Mutex<Table>>,
}

impl FakeBackend {
    pub fn tethered() -> Self {
        FakeBackend {
            table: Arc::new(Mutex::new(Table {
                secondary_up: true,
                routes: Vec::new(),
                default_gateway: PRIMARY_GATEWAY,
            })),
        }
    }

    pub fn routes(&self) -> Vec<Ipv4Cidr> {
        self.table.lock().unwrap().routes.iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl RoutingBackend for FakeBackend {
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>, Error> {
        Ok(vec![
            InterfaceInfo {
                name: "Wi-Fi".into(),
                device: "en0".into(),
                mac: Some("a4:83:e7:00:00:01".into()),
            },
            InterfaceInfo {
                name: "iPhone USB".into(),
                device: "en5".into(),
                mac: None,
            },
        ])
    }

    async fn is_active(&self, device: &str) -> Result<bool, Error> {
        Ok(device == "en0" || self.table.lock().unwrap().secondary_up)
    }

    async fn get_gateway(&self, device: &str) -> Result<Ipv4Addr, Error> {
        match device {
            "en0" => Ok(PRIMARY_GATEWAY),
            "en5" => Ok(SECONDARY_GATEWAY),
            other => Err(Error::NoGateway(other.to_string())),
        }
    }

    async fn add_route(&self, target: &Ipv4Cidr, via: &Via) -> Result<(), Error> {
        let mut table = self.table.lock().unwrap();
        if table.routes.iter().any(|(t, _)| t == target) {
            return Err(Error::General("File exists".into()));
        }
        table.routes.push((*target, via.clone()));
        Ok(())
    }

    async fn delete_route(&self, target: &Ipv4Cidr) -> Result<(), Error> {
        let mut table = self.table.lock().unwrap();
        let before = table.routes.len();
        table.routes.retain(|(t, _)| t != target);
        if table.routes.len() == before {
            return Err(Error::General("not in table".into()));
        }
        Ok(())
    }

    async fn change_default_gateway(&self, gateway: Ipv4Addr) -> Result<(), Error> {
        self.table.lock().unwrap().default_gateway = gateway;
        Ok(())
    }
}

/// Answers `example.com` only.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver;

pub const EXAMPLE_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

#[async_trait]
impl DomainResolver for StaticResolver {
    async fn resolve_ipv4(&self, name: &str, _timeout: Duration) -> Result<Vec<Ipv4Addr>, resolver::Error> {
        match name {
            "example.com" => Ok(vec![EXAMPLE_IP]),
            other => Err(resolver::Error::NoIpv4(other.to_string())),
        }
    }
}
