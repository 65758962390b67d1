//! Automatic routing decisions.
//!
//! The [`Monitor`] owns every change to the routing table. It runs a single loop that
//! reacts to the periodic interface check, to refresh signals and to commands from
//! the control plane, so routing operations never overlap. Other tasks talk to it
//! through a [`MonitorHandle`].
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::resolver::DomainResolver;
use crate::routing::{self, ResolvePolicy, RouteController, RoutingBackend, TargetStore};
use crate::schedule::{self, Schedule};
use crate::state::RoutingState;

/// Upper bound for clearing routes on the way out.
pub const SHUTDOWN_CLEAR_TIMEOUT: Duration = Duration::from_secs(30);

const COMMAND_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Routing(#[from] routing::Error),
    #[error("network monitor is not running")]
    Unavailable,
}

#[derive(Debug)]
pub enum MonitorCommand {
    ForceApply {
        resp: oneshot::Sender<Result<(), routing::Error>>,
    },
    ForceClear {
        resp: oneshot::Sender<Result<(), routing::Error>>,
    },
    AddDynamicRoute {
        ip: Ipv4Addr,
        resp: oneshot::Sender<Result<bool, routing::Error>>,
    },
}

/// Cloneable access to a running [`Monitor`].
#[derive(Clone, Debug)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    refresh: mpsc::Sender<()>,
    state: Arc<RoutingState>,
}

/// Receiving ends consumed by [`Monitor::run`].
#[derive(Debug)]
pub struct MonitorInbox {
    commands: mpsc::Receiver<MonitorCommand>,
    refresh: mpsc::Receiver<()>,
}

pub fn channel(state: Arc<RoutingState>) -> (MonitorHandle, MonitorInbox) {
    let (command_sender, command_receiver) = mpsc::channel(COMMAND_CAPACITY);
    // a single slot collapses refresh bursts into one pending refresh
    let (refresh_sender, refresh_receiver) = mpsc::channel(1);
    (
        MonitorHandle {
            commands: command_sender,
            refresh: refresh_sender,
            state,
        },
        MonitorInbox {
            commands: command_receiver,
            refresh: refresh_receiver,
        },
    )
}

impl MonitorHandle {
    pub fn state(&self) -> &RoutingState {
        &self.state
    }

    pub async fn force_apply(&self) -> Result<(), Error> {
        let (resp, rx) = oneshot::channel();
        self.send(MonitorCommand::ForceApply { resp }, rx).await
    }

    pub async fn force_clear(&self) -> Result<(), Error> {
        let (resp, rx) = oneshot::channel();
        self.send(MonitorCommand::ForceClear { resp }, rx).await
    }

    /// Returns `false` when the address was already routed.
    pub async fn add_dynamic_route(&self, ip: Ipv4Addr) -> Result<bool, Error> {
        let (resp, rx) = oneshot::channel();
        self.send(MonitorCommand::AddDynamicRoute { ip, resp }, rx).await
    }

    /// Enqueues a refresh without waiting for it. Returns `false` when one is already pending.
    pub fn request_refresh(&self) -> bool {
        match self.refresh.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::debug!("refresh already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::warn!("network monitor stopped - refresh dropped");
                false
            }
        }
    }

    async fn send<T>(
        &self,
        cmd: MonitorCommand,
        rx: oneshot::Receiver<Result<T, routing::Error>>,
    ) -> Result<T, Error> {
        self.commands.send(cmd).await.map_err(|_| Error::Unavailable)?;
        let res = rx.await.map_err(|_| Error::Unavailable)?;
        res.map_err(Error::from)
    }
}

pub struct Monitor<B, D> {
    config: Arc<Config>,
    backend: B,
    resolver: D,
    store: TargetStore,
    policy: ResolvePolicy,
    state: Arc<RoutingState>,
    /// Controller of the currently applied routes.
    active: Option<RouteController<B, D>>,
}

impl<B, D> Monitor<B, D>
where
    B: RoutingBackend,
    D: DomainResolver,
{
    pub fn new(config: Arc<Config>, backend: B, resolver: D, store: TargetStore, state: Arc<RoutingState>) -> Self {
        Monitor {
            config,
            backend,
            resolver,
            store,
            policy: ResolvePolicy::default(),
            state,
            active: None,
        }
    }

    pub fn with_resolve_policy(mut self, policy: ResolvePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs until `cancel` fires, then clears applied routes within [`SHUTDOWN_CLEAR_TIMEOUT`].
    ///
    /// The first interface check happens immediately.
    pub async fn run(mut self, mut inbox: MonitorInbox, cancel: CancellationToken) {
        tracing::info!(interval = %humantime::format_duration(self.config.check_interval), "starting network monitor");
        self.recover_stale_routes().await;

        let mut ticker = time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("network monitor stopping");
                    break;
                }
                Some(cmd) = inbox.commands.recv() => self.on_command(cmd).await,
                Some(()) = inbox.refresh.recv() => self.refresh().await,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "routing check failed");
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn on_command(&mut self, cmd: MonitorCommand) {
        match cmd {
            MonitorCommand::ForceApply { resp } => {
                let res = self.force_apply().await;
                let _ = resp.send(res);
            }
            MonitorCommand::ForceClear { resp } => {
                let res = self.force_clear().await;
                let _ = resp.send(res);
            }
            MonitorCommand::AddDynamicRoute { ip, resp } => {
                let res = self.add_dynamic_route(ip).await;
                let _ = resp.send(res);
            }
        }
    }

    fn controller(&self) -> RouteController<B, D> {
        RouteController::new(
            self.config.clone(),
            self.backend.clone(),
            self.resolver.clone(),
            self.store.clone(),
            self.policy,
        )
    }

    /// Fresh controller with whatever interfaces could be found.
    async fn detected_controller(&self) -> RouteController<B, D> {
        let mut controller = self.controller();
        if let Err(err) = controller.detect_interfaces().await {
            tracing::debug!(error = %err, "interface detection incomplete");
        }
        controller
    }

    /// Removes routes left behind by a previous run that did not shut down cleanly.
    async fn recover_stale_routes(&mut self) {
        if self.state.routes_applied() {
            return;
        }
        match self.store.load().await {
            Ok(Some(stale)) => {
                tracing::warn!(targets = stale.len(), "found routes from a previous run - cleaning up");
                let mut controller = self.detected_controller().await;
                if let Err(err) = controller.clear_routes().await {
                    tracing::error!(error = %err, "unable to clean up routes from a previous run");
                }
            }
            Ok(None) => (),
            Err(err) => tracing::warn!(error = %err, "unable to read persisted targets"),
        }
    }

    /// One evaluation of the routing policy:
    ///
    /// | auto-routing | both interfaces up | routes applied | action |
    /// |---|---|---|---|
    /// | off | any | yes | force clear |
    /// | on | yes | no | apply |
    /// | on | no | yes | clear |
    ///
    /// Everything else leaves the routing table alone.
    pub async fn tick(&mut self) -> Result<(), routing::Error> {
        let mut controller = self.detected_controller().await;
        let status = controller.interface_status().await;
        self.state.update_interface_status(status.primary, status.secondary);

        let applied = self.state.routes_applied();
        if !self.state.auto_routing_enabled() {
            if applied {
                tracing::info!("auto-routing disabled, clearing existing routes");
                self.force_clear().await?;
            }
            return Ok(());
        }

        if status.both_active() && !applied {
            tracing::info!("both interfaces detected, applying routes");
            controller.apply_routes().await?;
            self.active = Some(controller);
            self.state.set_routes_applied(true);
            tracing::info!("routes automatically applied");
        } else if !status.both_active() && applied {
            tracing::info!(
                primary = status.primary,
                secondary = status.secondary,
                "interface lost, clearing routes"
            );
            let mut active = self.active.take().unwrap_or(controller);
            if let Err(err) = active.clear_routes().await {
                self.active = Some(active);
                return Err(err);
            }
            self.state.set_routes_applied(false);
            tracing::info!("routes automatically cleared");
        }
        Ok(())
    }

    /// Best effort clear followed by a policy evaluation. Skipped unless routes are applied.
    ///
    /// Independent of the auto-routing flag, the following evaluation honours it.
    pub async fn refresh(&mut self) {
        if !self.state.routes_applied() {
            tracing::info!("routes not applied - skipping refresh");
            return;
        }
        tracing::info!("refreshing routes");

        let mut controller = match self.active.take() {
            Some(active) => active,
            None => self.detected_controller().await,
        };
        if let Err(err) = controller.clear_routes().await {
            tracing::warn!(error = %err, "clearing routes during refresh failed");
        }
        self.state.set_routes_applied(false);

        match self.tick().await {
            Ok(()) if self.state.routes_applied() => tracing::info!("routes refreshed"),
            Ok(()) => tracing::info!("refresh finished without re-applying routes"),
            Err(err) => tracing::warn!(error = %err, "re-applying routes during refresh failed"),
        }
    }

    /// Applies routes regardless of the auto-routing flag.
    pub async fn force_apply(&mut self) -> Result<(), routing::Error> {
        tracing::info!("applying routes on request");
        let mut controller = self.controller();
        controller.detect_interfaces().await?;
        let status = controller.interface_status().await;
        self.state.update_interface_status(status.primary, status.secondary);

        controller.apply_routes().await?;
        self.active = Some(controller);
        self.state.set_routes_applied(true);
        Ok(())
    }

    /// Clears routes and disables auto-routing so the next check does not re-apply them.
    pub async fn force_clear(&mut self) -> Result<(), routing::Error> {
        tracing::info!("clearing routes on request");
        if self.state.set_auto_routing(false) {
            tracing::info!("auto-routing disabled");
        }

        let mut controller = match self.active.take() {
            Some(active) => active,
            None => self.detected_controller().await,
        };
        if let Err(err) = controller.clear_routes().await {
            self.active = Some(controller);
            return Err(err);
        }
        self.state.set_routes_applied(false);
        Ok(())
    }

    pub async fn add_dynamic_route(&mut self, ip: Ipv4Addr) -> Result<bool, routing::Error> {
        match self.active.as_mut() {
            Some(active) if self.state.routes_applied() => active.add_dynamic_route(ip).await,
            _ => Err(routing::Error::NotApplied),
        }
    }

    async fn shutdown(&mut self) {
        if !self.state.routes_applied() {
            return;
        }
        tracing::info!("clearing routes before exit");
        let mut controller = match self.active.take() {
            Some(active) => active,
            None => self.detected_controller().await,
        };
        match time::timeout(SHUTDOWN_CLEAR_TIMEOUT, controller.clear_routes()).await {
            Ok(Ok(())) => {
                self.state.set_routes_applied(false);
                tracing::info!("routes cleared");
            }
            Ok(Err(err)) => tracing::error!(error = %err, "failed to clear routes on shutdown"),
            Err(_) => tracing::error!(timeout = ?SHUTDOWN_CLEAR_TIMEOUT, "timed out clearing routes on shutdown"),
        }
    }
}

/// Requests a refresh at every occurrence of `schedule`.
pub async fn run_refresh_schedule(schedule: Schedule, handle: MonitorHandle, cancel: CancellationToken) {
    schedule::run("route-refresh", schedule, cancel, || {
        let handle = handle.clone();
        async move {
            tracing::info!("scheduled route refresh");
            handle.request_refresh();
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingTargetSet;
    use crate::routing::mocks::{self, MockBackend, MockResolver};

    use cidr::Ipv4Cidr;
    use std::str::FromStr;

    struct Fixture {
        backend: MockBackend,
        resolver: MockResolver,
        state: Arc<RoutingState>,
        store: TargetStore,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            Ok(Fixture {
                backend: mocks::tethered_backend(),
                resolver: MockResolver::new(),
                state: Arc::new(RoutingState::default()),
                store: TargetStore::new(dir.path().join("routed_targets.yaml")),
                _dir: dir,
            })
        }

        fn monitor(&self) -> anyhow::Result<Monitor<MockBackend, MockResolver>> {
            let config = Arc::new(Config {
                cidrs: vec![Ipv4Cidr::from_str("10.0.0.0/8")?],
                check_interval: Duration::from_secs(3600),
                ..Config::default()
            });
            Ok(Monitor::new(
                config,
                self.backend.clone(),
                self.resolver.clone(),
                self.store.clone(),
                self.state.clone(),
            )
            .with_resolve_policy(mocks::instant_policy()))
        }

        fn route_count(&self) -> usize {
            self.backend.state.lock().unwrap().routes.len()
        }

        fn added(&self) -> usize {
            self.backend.state.lock().unwrap().added.len()
        }
    }

    #[tokio::test]
    async fn tick_applies_when_both_interfaces_come_up() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;

        monitor.tick().await?;

        assert!(fx.state.routes_applied());
        assert_eq!(fx.route_count(), 1);
        assert_eq!(fx.state.interface_status(), (true, true));
        Ok(())
    }

    #[tokio::test]
    async fn tick_without_change_is_a_no_op() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;

        monitor.tick().await?;
        monitor.tick().await?;

        assert_eq!(fx.added(), 1, "applied exactly once");
        Ok(())
    }

    #[tokio::test]
    async fn tick_clears_when_secondary_goes_down() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;
        monitor.tick().await?;

        fx.backend.set_active("en5", false);
        monitor.tick().await?;

        assert!(!fx.state.routes_applied());
        assert_eq!(fx.route_count(), 0);
        assert_eq!(fx.state.interface_status(), (true, false));
        assert!(fx.state.auto_routing_enabled(), "automatic clear keeps auto-routing on");
        Ok(())
    }

    #[tokio::test]
    async fn tick_does_nothing_when_only_one_interface_is_up() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.backend.set_active("en0", false);
        let mut monitor = fx.monitor()?;

        monitor.tick().await?;

        assert!(!fx.state.routes_applied());
        assert_eq!(fx.added(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_apply_leaves_routes_unapplied_and_retries_next_tick() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;
        fx.backend.fail("list_interfaces", "no interfaces");

        monitor.tick().await?;
        assert!(!fx.state.routes_applied(), "nothing detected, nothing applied");

        fx.backend.state.lock().unwrap().fail_on.clear();
        monitor.tick().await?;
        assert!(fx.state.routes_applied());
        Ok(())
    }

    #[tokio::test]
    async fn tick_honours_disabled_auto_routing() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.state.set_auto_routing(false);
        let mut monitor = fx.monitor()?;

        monitor.tick().await?;

        assert!(!fx.state.routes_applied());
        assert_eq!(fx.added(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn disabling_auto_routing_clears_on_next_tick_exactly_once() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;
        monitor.tick().await?;

        fx.state.set_auto_routing(false);
        monitor.tick().await?;
        monitor.tick().await?;

        assert!(!fx.state.routes_applied());
        assert_eq!(fx.route_count(), 0);
        assert_eq!(fx.backend.state.lock().unwrap().deleted.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn force_clear_disables_auto_routing_and_is_idempotent() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;
        monitor.force_apply().await?;

        monitor.force_clear().await?;
        monitor.force_clear().await?;
        monitor.tick().await?;

        assert!(!fx.state.auto_routing_enabled());
        assert!(!fx.state.routes_applied());
        assert_eq!(fx.route_count(), 0);
        assert_eq!(fx.added(), 1, "tick must not re-apply");
        Ok(())
    }

    #[tokio::test]
    async fn force_apply_ignores_disabled_auto_routing() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.state.set_auto_routing(false);
        let mut monitor = fx.monitor()?;

        monitor.force_apply().await?;

        assert!(fx.state.routes_applied());
        assert!(!fx.state.auto_routing_enabled());
        Ok(())
    }

    #[tokio::test]
    async fn force_apply_requires_both_interfaces() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.backend.state.lock().unwrap().interfaces.retain(|i| i.device != "en5");
        let mut monitor = fx.monitor()?;

        let err = monitor.force_apply().await.expect_err("secondary missing");
        assert!(matches!(err, routing::Error::InterfaceNotFound { .. }));
        assert!(!fx.state.routes_applied());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_reapplies_applied_routes() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;
        monitor.tick().await?;

        monitor.refresh().await;

        assert!(fx.state.routes_applied());
        assert_eq!(fx.added(), 2);
        assert_eq!(fx.route_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_is_skipped_when_not_applied() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.backend.set_active("en5", false);
        let mut monitor = fx.monitor()?;

        monitor.refresh().await;

        assert_eq!(fx.added(), 0);
        assert!(fx.backend.state.lock().unwrap().deleted.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_with_disabled_auto_routing_only_clears() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.state.set_auto_routing(false);
        let mut monitor = fx.monitor()?;
        monitor.force_apply().await?;

        monitor.refresh().await;

        assert!(!fx.state.routes_applied());
        assert_eq!(fx.route_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn dynamic_route_requires_applied_routes() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let mut monitor = fx.monitor()?;
        let ip = Ipv4Addr::new(198, 51, 100, 1);

        let err = monitor.add_dynamic_route(ip).await.expect_err("nothing applied");
        assert!(matches!(err, routing::Error::NotApplied));

        monitor.tick().await?;
        assert!(monitor.add_dynamic_route(ip).await?);
        assert_eq!(fx.route_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn stale_routes_from_previous_run_are_removed_on_start() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.backend.set_active("en5", false);
        let stale = Ipv4Addr::new(203, 0, 113, 7);
        fx.store
            .store(&RoutingTargetSet {
                ips: vec![stale],
                cidrs: Vec::new(),
            })
            .await?;
        fx.backend.install(Ipv4Cidr::new_host(stale));

        let mut monitor = fx.monitor()?;
        monitor.recover_stale_routes().await;

        assert_eq!(fx.route_count(), 0);
        assert_eq!(fx.store.load().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_requests_collapse_while_one_is_pending() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let (handle, inbox) = channel(fx.state.clone());

        assert!(handle.request_refresh());
        assert!(!handle.request_refresh());
        assert!(!handle.request_refresh());

        let mut monitor = fx.monitor()?;
        monitor.tick().await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(inbox, cancel.clone()));

        // initial tick is a no-op, the single pending refresh re-adds the route once
        time::timeout(Duration::from_secs(5), async {
            while fx.added() < 2 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.added(), 2);

        cancel.cancel();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn handle_commands_are_served_by_the_loop() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.state.set_auto_routing(false);
        let (handle, inbox) = channel(fx.state.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fx.monitor()?.run(inbox, cancel.clone()));

        handle.force_apply().await?;
        assert!(handle.state().routes_applied());
        handle.force_clear().await?;
        assert!(!handle.state().routes_applied());

        cancel.cancel();
        task.await?;
        assert!(matches!(handle.force_apply().await, Err(Error::Unavailable)));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_clears_applied_routes() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let (_handle, inbox) = channel(fx.state.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fx.monitor()?.run(inbox, cancel.clone()));

        time::timeout(Duration::from_secs(5), async {
            while !fx.state.routes_applied() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        cancel.cancel();
        task.await?;

        assert!(!fx.state.routes_applied());
        assert_eq!(fx.route_count(), 0);
        assert_eq!(fx.store.load().await?, None);
        Ok(())
    }
}
