use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use crate::log_output;

/// Shared daemon status.
///
/// The monitor loop writes it, control plane handlers read it. Every accessor takes
/// the lock for the duration of a single field access only, so no caller ever holds
/// it across IO.
#[derive(Debug)]
pub struct RoutingState {
    inner: RwLock<Inner>,
}

#[derive(Clone, Debug, Default)]
struct Inner {
    auto_routing_enabled: bool,
    routes_applied: bool,
    primary_active: bool,
    secondary_active: bool,
    last_applied_at: Option<SystemTime>,
    last_cleared_at: Option<SystemTime>,
}

/// Point in time copy of [`RoutingState`] as reported by the `status` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub auto_routing_enabled: bool,
    pub routes_applied: bool,
    #[serde(rename = "wifi_active")]
    pub primary_active: bool,
    #[serde(rename = "phone_active")]
    pub secondary_active: bool,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<SystemTime>,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub last_cleared_at: Option<SystemTime>,
}

impl RoutingState {
    pub fn new(auto_routing_enabled: bool) -> Self {
        RoutingState {
            inner: RwLock::new(Inner {
                auto_routing_enabled,
                ..Inner::default()
            }),
        }
    }

    // a panicking writer cannot leave a field half written, the data stays usable
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn auto_routing_enabled(&self) -> bool {
        self.read().auto_routing_enabled
    }

    /// Returns the previous value.
    pub fn set_auto_routing(&self, enabled: bool) -> bool {
        let mut inner = self.write();
        std::mem::replace(&mut inner.auto_routing_enabled, enabled)
    }

    pub fn routes_applied(&self) -> bool {
        self.read().routes_applied
    }

    /// Timestamps are only stamped on an actual transition of the flag.
    pub fn set_routes_applied(&self, applied: bool) {
        let mut inner = self.write();
        if inner.routes_applied == applied {
            return;
        }
        inner.routes_applied = applied;
        let now = SystemTime::now();
        if applied {
            inner.last_applied_at = Some(now);
        } else {
            inner.last_cleared_at = Some(now);
        }
    }

    pub fn update_interface_status(&self, primary_active: bool, secondary_active: bool) {
        let mut inner = self.write();
        inner.primary_active = primary_active;
        inner.secondary_active = secondary_active;
    }

    /// Returns `(primary_active, secondary_active)`.
    pub fn interface_status(&self) -> (bool, bool) {
        let inner = self.read();
        (inner.primary_active, inner.secondary_active)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.read();
        StatusSnapshot {
            auto_routing_enabled: inner.auto_routing_enabled,
            routes_applied: inner.routes_applied,
            primary_active: inner.primary_active,
            secondary_active: inner.secondary_active,
            last_applied_at: inner.last_applied_at,
            last_cleared_at: inner.last_cleared_at,
        }
    }
}

impl Default for RoutingState {
    fn default() -> Self {
        RoutingState::new(true)
    }
}

impl Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Auto-routing:     {}", on_off(self.auto_routing_enabled))?;
        writeln!(f, "Routes applied:   {}", yes_no(self.routes_applied))?;
        writeln!(f, "Primary active:   {}", yes_no(self.primary_active))?;
        write!(f, "Secondary active: {}", yes_no(self.secondary_active))?;
        if let Some(at) = &self.last_applied_at {
            write!(f, "\nLast applied:     {} ({} ago)", humantime::format_rfc3339_seconds(*at), log_output::elapsed(at))?;
        }
        if let Some(at) = &self.last_cleared_at {
            write!(f, "\nLast cleared:     {} ({} ago)", humantime::format_rfc3339_seconds(*at), log_output::elapsed(at))?;
        }
        Ok(())
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "enabled" } else { "disabled" }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
