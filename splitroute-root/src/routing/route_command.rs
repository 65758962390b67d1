//! Routing backend using the BSD network tools.
//!
//! [`RouteCommandBackend`] implements [`RoutingBackend`] by shelling out to
//! `networksetup`, `ifconfig`, `ipconfig` and `route`. The commands need root.

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use tokio::process::Command;

use std::net::Ipv4Addr;

use splitroute_lib::routing::backend::Error;
use splitroute_lib::routing::{InterfaceInfo, RoutingBackend, Via, target_string};
use splitroute_lib::shell_command_ext::{Logs, ShellCommandExt};

/// Build the argument list for a `route add` invocation.
///
/// With a gateway the route points at the next hop. Without one, `-interface`
/// marks the destination as directly reachable via the named interface.
fn route_add_args(target: &Ipv4Cidr, via: &Via) -> Vec<String> {
    let mut args = vec!["-n".into(), "add".into(), "-inet".into(), target_string(target)];
    match via {
        Via::Gateway(gateway) => args.push(gateway.to_string()),
        Via::Device(device) => {
            args.push("-interface".into());
            args.push(device.clone());
        }
    }
    args
}

fn route_delete_args(target: &Ipv4Cidr) -> Vec<String> {
    vec!["-n".into(), "delete".into(), "-inet".into(), target_string(target)]
}

#[derive(Clone, Debug, Default)]
pub struct RouteCommandBackend;

#[async_trait]
impl RoutingBackend for RouteCommandBackend {
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>, Error> {
        let output = Command::new("networksetup")
            .arg("-listallhardwareports")
            .run_stdout(Logs::Print)
            .await?;
        Ok(parse_hardware_ports(&output))
    }

    async fn is_active(&self, device: &str) -> Result<bool, Error> {
        // fails for devices that vanished, which is expected while unplugging
        let output = Command::new("ifconfig").arg(device).run_stdout(Logs::Suppress).await?;
        Ok(has_ipv4_address(&output))
    }

    async fn get_gateway(&self, device: &str) -> Result<Ipv4Addr, Error> {
        let output = Command::new("ipconfig")
            .arg("getoption")
            .arg(device)
            .arg("router")
            .run_stdout(Logs::Suppress)
            .await?;
        parse_gateway(device, &output)
    }

    async fn add_route(&self, target: &Ipv4Cidr, via: &Via) -> Result<(), Error> {
        Command::new("route")
            .args(route_add_args(target, via))
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn delete_route(&self, target: &Ipv4Cidr) -> Result<(), Error> {
        Command::new("route")
            .args(route_delete_args(target))
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn change_default_gateway(&self, gateway: Ipv4Addr) -> Result<(), Error> {
        let gw = gateway.to_string();
        let changed = Command::new("route")
            .args(["-n", "change", "default", gw.as_str()])
            .run(Logs::Suppress)
            .await;
        if let Err(err) = changed {
            // no default route present, add one
            tracing::debug!(error = %err, %gateway, "changing default route failed - adding it");
            Command::new("route")
                .args(["-n", "add", "default", gw.as_str()])
                .run(Logs::Print)
                .await?;
        }
        Ok(())
    }
}

/// Parses `networksetup -listallhardwareports` output.
///
/// ```text
/// Hardware Port: Wi-Fi
/// Device: en0
/// Ethernet Address: a4:83:e7:00:00:01
/// ```
pub(crate) fn parse_hardware_ports(output: &str) -> Vec<InterfaceInfo> {
    let mut interfaces = Vec::new();
    let mut current: Option<InterfaceInfo> = None;

    for line in output.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("Hardware Port:") {
            if let Some(done) = current.take() {
                interfaces.push(done);
            }
            current = Some(InterfaceInfo {
                name: name.trim().to_string(),
                device: String::new(),
                mac: None,
            });
        } else if let Some(device) = line.strip_prefix("Device:") {
            if let Some(iface) = current.as_mut() {
                iface.device = device.trim().to_string();
            }
        } else if let Some(mac) = line.strip_prefix("Ethernet Address:") {
            let mac = mac.trim();
            if let Some(iface) = current.as_mut()
                && !mac.is_empty()
                && mac != "N/A"
            {
                iface.mac = Some(mac.to_string());
            }
        }
    }
    if let Some(done) = current {
        interfaces.push(done);
    }

    // ports without a device cannot carry routes
    interfaces.retain(|i| !i.device.is_empty());
    interfaces
}

/// `inet ` lines carry IPv4 addresses, `inet6 ` lines are ignored.
pub(crate) fn has_ipv4_address(ifconfig_output: &str) -> bool {
    ifconfig_output.lines().any(|line| line.trim_start().starts_with("inet "))
}

pub(crate) fn parse_gateway(device: &str, output: &str) -> Result<Ipv4Addr, Error> {
    let value = output.trim();
    if value.is_empty() {
        return Err(Error::NoGateway(device.to_string()));
    }
    value.parse::<Ipv4Addr>().map_err(|e| Error::Parse {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
