//! One apply or clear cycle of split routing.
//!
//! A [`RouteController`] captures the detected interfaces and their gateways at apply
//! time and remembers the installed target set. The same instance should be used for
//! the matching clear, so the original default gateway can be restored even after the
//! primary interface disappeared.
use backon::{ConstantBuilder, Retryable};
use cidr::Ipv4Cidr;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::log_output;
use crate::resolver::{self, DomainResolver};

use super::backend::{InterfaceInfo, RoutingBackend, Via};
use super::store::{RoutingTargetSet, TargetStore};
use super::{Error, Role, target_string};

/// Retry behaviour of domain resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvePolicy {
    /// Attempts per domain while both interfaces are up. Otherwise a single attempt is made.
    pub attempts: usize,
    pub delay: Duration,
    /// Per attempt.
    pub timeout: Duration,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        ResolvePolicy {
            attempts: 3,
            delay: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterfaceStatus {
    pub primary: bool,
    pub secondary: bool,
}

impl InterfaceStatus {
    pub fn both_active(&self) -> bool {
        self.primary && self.secondary
    }
}

/// Outcome of resolving the configured domains.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Distinct addresses in first seen order.
    pub ips: Vec<Ipv4Addr>,
    pub failed: Vec<String>,
    pub total: usize,
}

pub struct RouteController<B, D> {
    config: Arc<Config>,
    backend: B,
    resolver: D,
    store: TargetStore,
    policy: ResolvePolicy,
    primary: Option<InterfaceInfo>,
    secondary: Option<InterfaceInfo>,
    primary_gateway: Option<Ipv4Addr>,
    secondary_gateway: Option<Ipv4Addr>,
    targets: Option<RoutingTargetSet>,
}

impl<B, D> RouteController<B, D>
where
    B: RoutingBackend,
    D: DomainResolver,
{
    pub fn new(config: Arc<Config>, backend: B, resolver: D, store: TargetStore, policy: ResolvePolicy) -> Self {
        RouteController {
            config,
            backend,
            resolver,
            store,
            policy,
            primary: None,
            secondary: None,
            primary_gateway: None,
            secondary_gateway: None,
            targets: None,
        }
    }

    pub fn primary(&self) -> Option<&InterfaceInfo> {
        self.primary.as_ref()
    }

    pub fn secondary(&self) -> Option<&InterfaceInfo> {
        self.secondary.as_ref()
    }

    /// The set installed by the last successful apply, extended by dynamic routes.
    pub fn targets(&self) -> Option<&RoutingTargetSet> {
        self.targets.as_ref()
    }

    /// Finds both interfaces by keyword. Keywords are tried in order, the first
    /// interface whose name contains the keyword wins.
    ///
    /// Both roles are always looked up, the error names the first missing one.
    pub async fn detect_interfaces(&mut self) -> Result<(), Error> {
        let interfaces = self.backend.list_interfaces().await?;
        self.primary = find_interface(&interfaces, &self.config.primary_keywords);
        self.secondary = find_interface(&interfaces, &self.config.secondary_keywords);

        if let Some(primary) = &self.primary {
            tracing::debug!(interface = %primary, "found primary interface");
        }
        if let Some(secondary) = &self.secondary {
            tracing::debug!(interface = %secondary, "found secondary interface");
        }

        if self.primary.is_none() {
            return Err(not_found(Role::Primary, &self.config.primary_keywords));
        }
        if self.secondary.is_none() {
            return Err(not_found(Role::Secondary, &self.config.secondary_keywords));
        }
        Ok(())
    }

    /// Activity of the detected interfaces. Undetected or unreadable interfaces count as inactive.
    pub async fn interface_status(&self) -> InterfaceStatus {
        InterfaceStatus {
            primary: self.is_active(self.primary.as_ref()).await,
            secondary: self.is_active(self.secondary.as_ref()).await,
        }
    }

    async fn is_active(&self, interface: Option<&InterfaceInfo>) -> bool {
        let Some(interface) = interface else {
            return false;
        };
        match self.backend.is_active(&interface.device).await {
            Ok(active) => active,
            Err(err) => {
                tracing::debug!(interface = %interface, error = %err, "unable to read interface activity");
                false
            }
        }
    }

    /// Resolves every configured domain to IPv4 addresses.
    ///
    /// Domains are resolved one after another. With both interfaces up each domain gets
    /// the retry budget of the [`ResolvePolicy`], otherwise a single attempt. Fails only
    /// when domains are configured and none of them resolved.
    pub async fn resolve_domains(&self, both_active: bool) -> Result<Resolution, Error> {
        let names = resolution_names(&self.config.domains);
        let mut resolution = Resolution {
            total: names.len(),
            ..Resolution::default()
        };
        if names.is_empty() {
            return Ok(resolution);
        }

        let attempts = if both_active {
            tracing::warn!("both interfaces active - DNS resolution may time out");
            self.policy.attempts.max(1)
        } else {
            1
        };

        let mut resolved = 0;
        for name in names {
            match self.resolve_with_retry(&name, attempts).await {
                Ok(found) => {
                    tracing::info!(domain = %name, ips = %log_output::ips(&found), "resolved domain");
                    resolved += 1;
                    for ip in found {
                        if !resolution.ips.contains(&ip) {
                            resolution.ips.push(ip);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(domain = %name, error = %err, attempts, "failed to resolve domain");
                    resolution.failed.push(name);
                }
            }
        }

        tracing::info!(
            resolved,
            failed = resolution.failed.len(),
            total = resolution.total,
            ips = resolution.ips.len(),
            "domain resolution finished"
        );
        if !resolution.failed.is_empty() {
            let sample = resolution.failed.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
            tracing::warn!(domains = %sample, "unresolved domains");
        }
        if resolved == 0 {
            return Err(Error::NoDomainsResolved {
                total: resolution.total,
            });
        }
        Ok(resolution)
    }

    async fn resolve_with_retry(&self, name: &str, attempts: usize) -> Result<Vec<Ipv4Addr>, resolver::Error> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.policy.delay)
            .with_max_times(attempts.saturating_sub(1));
        let timeout = self.policy.timeout;
        (|| async { self.resolver.resolve_ipv4(name, timeout).await })
            .retry(backoff)
            .notify(|err: &resolver::Error, dur: Duration| {
                tracing::debug!(domain = %name, error = %err, "retrying resolution after {:?}", dur);
            })
            .await
    }

    /// Installs routes for the configured CIDRs and the resolved domain addresses via
    /// the secondary interface.
    ///
    /// Gateways are captured and domains resolved before the routing table is touched.
    /// A failing individual route is logged and skipped. On success the target set is
    /// persisted (a failed write is only logged) and remembered for the matching clear.
    pub async fn apply_routes(&mut self) -> Result<(), Error> {
        let primary = self
            .primary
            .clone()
            .ok_or_else(|| not_found(Role::Primary, &self.config.primary_keywords))?;
        let secondary = self
            .secondary
            .clone()
            .ok_or_else(|| not_found(Role::Secondary, &self.config.secondary_keywords))?;

        tracing::info!(primary = %primary, secondary = %secondary, "applying routing rules");
        self.primary_gateway = self.capture_gateway(Role::Primary, &primary).await;
        self.secondary_gateway = self.capture_gateway(Role::Secondary, &secondary).await;

        let status = self.interface_status().await;
        let resolution = self.resolve_domains(status.both_active()).await?;

        let set = RoutingTargetSet {
            ips: resolution.ips,
            cidrs: self.config.cidrs.clone(),
        };
        tracing::info!(cidrs = set.cidrs.len(), ips = set.ips.len(), "routing plan");
        if set.is_empty() {
            tracing::warn!("nothing to route - configure tether_cidrs or tether_domains");
            return Err(Error::NoRoutesToApply);
        }

        let via = self.secondary_via(&secondary);
        let mut installed = 0;
        for target in set.targets() {
            match self.backend.add_route(&target, &via).await {
                Ok(()) => {
                    installed += 1;
                    tracing::info!(target = %target_string(&target), %via, "added route");
                }
                Err(err) => {
                    tracing::warn!(target = %target_string(&target), %via, error = %err, "failed to add route");
                }
            }
        }

        if let Err(err) = self.store.store(&set).await {
            tracing::warn!(path = %self.store.path().display(), error = %err, "unable to persist routed targets");
        }
        tracing::info!(installed, total = set.len(), "routing configuration completed");
        self.targets = Some(set);
        Ok(())
    }

    /// Routes a single address via the secondary interface. Returns `false` when it is
    /// already routed.
    pub async fn add_dynamic_route(&mut self, ip: Ipv4Addr) -> Result<bool, Error> {
        if self.targets.as_ref().is_some_and(|t| t.contains_ip(&ip)) {
            tracing::debug!(%ip, "address already routed");
            return Ok(false);
        }
        let secondary = self
            .secondary
            .clone()
            .ok_or_else(|| not_found(Role::Secondary, &self.config.secondary_keywords))?;
        let via = self.secondary_via(&secondary);

        self.backend.add_route(&Ipv4Cidr::new_host(ip), &via).await?;
        tracing::info!(%ip, %via, "added dynamic route");

        let set = self
            .targets
            .get_or_insert_with(|| RoutingTargetSet::new(self.config.cidrs.clone()));
        set.ips.push(ip);
        self.store.store(set).await?;
        Ok(true)
    }

    /// Restores the default gateway and removes every routed target.
    ///
    /// The persisted target set takes precedence. Without one the remembered set is
    /// used, and without that the configured CIDRs plus a fresh resolution. Individual
    /// failures are logged, only a failure to remove the persisted set is an error.
    pub async fn clear_routes(&mut self) -> Result<(), Error> {
        tracing::info!("cleaning up routing configuration");
        self.restore_default_gateway().await;

        match self.store.load().await {
            Ok(Some(persisted)) => {
                tracing::info!(path = %self.store.path().display(), targets = persisted.len(), "clearing persisted targets");
                self.delete_targets(&persisted).await;
                self.store.remove().await?;
                self.targets = None;
                tracing::info!("routing configuration cleared");
                return Ok(());
            }
            Ok(None) => {
                tracing::info!("no persisted targets found - falling back to configuration");
            }
            Err(err) => {
                tracing::warn!(error = %err, "unreadable persisted targets - falling back to configuration");
                if let Err(err) = self.store.remove().await {
                    tracing::warn!(error = %err, "unable to remove unreadable persisted targets");
                }
            }
        }

        let fallback = match self.targets.take() {
            Some(live) => RoutingTargetSet {
                ips: live.ips,
                cidrs: self.config.cidrs.clone(),
            },
            None => {
                let status = self.interface_status().await;
                let ips = match self.resolve_domains(status.both_active()).await {
                    Ok(resolution) => resolution.ips,
                    Err(err) => {
                        tracing::warn!(error = %err, "unable to resolve domains for cleanup");
                        Vec::new()
                    }
                };
                RoutingTargetSet {
                    ips,
                    cidrs: self.config.cidrs.clone(),
                }
            }
        };
        self.delete_targets(&fallback).await;
        tracing::info!("routing configuration cleared");
        Ok(())
    }

    async fn delete_targets(&self, set: &RoutingTargetSet) {
        for target in set.targets() {
            match self.backend.delete_route(&target).await {
                Ok(()) => tracing::info!(target = %target_string(&target), "deleted route"),
                Err(err) => tracing::warn!(target = %target_string(&target), error = %err, "failed to delete route"),
            }
        }
    }

    async fn restore_default_gateway(&self) {
        let gateway = match (self.primary_gateway, &self.primary) {
            (Some(gateway), _) => Some(gateway),
            (None, Some(primary)) => self.capture_gateway(Role::Primary, primary).await,
            (None, None) => None,
        };
        let Some(gateway) = gateway else {
            tracing::warn!("primary gateway unknown - default route left untouched");
            return;
        };
        match self.backend.change_default_gateway(gateway).await {
            Ok(()) => tracing::info!(%gateway, "restored default gateway"),
            Err(err) => tracing::warn!(%gateway, error = %err, "failed to restore default gateway"),
        }
    }

    async fn capture_gateway(&self, role: Role, interface: &InterfaceInfo) -> Option<Ipv4Addr> {
        match self.backend.get_gateway(&interface.device).await {
            Ok(gateway) => {
                tracing::debug!(%role, interface = %interface, %gateway, "captured gateway");
                Some(gateway)
            }
            Err(err) => {
                tracing::warn!(%role, interface = %interface, error = %err, "unable to determine gateway");
                None
            }
        }
    }

    fn secondary_via(&self, secondary: &InterfaceInfo) -> Via {
        match self.secondary_gateway {
            Some(gateway) => Via::Gateway(gateway),
            None => Via::Device(secondary.device.clone()),
        }
    }
}

fn find_interface(interfaces: &[InterfaceInfo], keywords: &[String]) -> Option<InterfaceInfo> {
    keywords
        .iter()
        .map(|keyword| keyword.to_lowercase())
        .find_map(|keyword| {
            interfaces
                .iter()
                .find(|i| i.name.to_lowercase().contains(&keyword))
        })
        .cloned()
}

fn not_found(role: Role, keywords: &[String]) -> Error {
    Error::InterfaceNotFound {
        role,
        keywords: keywords.join(", "),
    }
}

/// Strips wildcard prefixes and drops duplicates, case-insensitively, keeping order.
fn resolution_names(domains: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for domain in domains {
        let name = domain.trim();
        let name = name.strip_prefix("*.").unwrap_or(name).to_ascii_lowercase();
        if name.is_empty() || names.contains(&name) {
            continue;
        }
        names.push(name);
    }
    names
}
