use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::log_output;
use crate::state::StatusSnapshot;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Applying or clearing routes may wait on several DNS timeouts.
pub const SLOW_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Control plane verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Status,
    Enable,
    Disable,
    Apply,
    Clear,
    Restart,
    Refresh,
    AddRoute,
}

#[derive(Debug, Error)]
#[error("Unknown action: {0}")]
pub struct UnknownAction(pub String);

/// Request as sent over the control socket, e.g. `{"action":"apply"}`.
///
/// The action stays a plain string on the wire so unknown verbs can be answered
/// with a proper error response instead of a parse failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusSnapshot>,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Status,
        Action::Enable,
        Action::Disable,
        Action::Apply,
        Action::Clear,
        Action::Restart,
        Action::Refresh,
        Action::AddRoute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Status => "status",
            Action::Enable => "enable",
            Action::Disable => "disable",
            Action::Apply => "apply",
            Action::Clear => "clear",
            Action::Restart => "restart",
            Action::Refresh => "refresh",
            Action::AddRoute => "add_route",
        }
    }

    /// Verbs that touch the routing table and may take a while.
    pub fn is_slow(&self) -> bool {
        matches!(
            self,
            Action::Apply | Action::Clear | Action::Restart | Action::Refresh | Action::AddRoute
        )
    }

    /// How long a client waits for the response.
    pub fn timeout(&self) -> Duration {
        if self.is_slow() {
            SLOW_COMMAND_TIMEOUT
        } else {
            DEFAULT_TIMEOUT
        }
    }
}

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Request {
    pub fn new(action: Action) -> Self {
        Request {
            action: action.as_str().to_string(),
            params: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

impl FromStr for Request {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str::<Request>(s)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", log_output::serialize(self))
    }
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Response {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn status(snapshot: StatusSnapshot) -> Self {
        Response {
            success: true,
            message: None,
            data: Some(snapshot),
        }
    }
}

impl FromStr for Response {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str::<Response>(s)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", log_output::serialize(self))
    }
}
