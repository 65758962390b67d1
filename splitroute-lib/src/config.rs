use cidr::Ipv4Cidr;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::schedule::{self, Schedule};

pub const DEFAULT_PATH: &str = "/etc/splitroute/config.toml";
pub const ENV_VAR: &str = "SPLITROUTE_CONFIG_PATH";

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LOG_TRUNCATE_CRON: &str = "0 0 10 * * *";

/// Always appended after the configured keywords, in this order.
pub const PRIMARY_FALLBACK_KEYWORDS: &[&str] = &["Wi-Fi"];
pub const SECONDARY_FALLBACK_KEYWORDS: &[&str] = &["iPhone USB", "iPad USB", "RNDIS"];

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub domains: Vec<String>,
    pub cidrs: Vec<Ipv4Cidr>,
    pub primary_keywords: Vec<String>,
    pub secondary_keywords: Vec<String>,
    pub refresh_schedule: Option<Schedule>,
    pub check_interval: Duration,
    pub log_truncate_schedule: Option<Schedule>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Invalid CIDR `{value}`: {reason}")]
    InvalidCidr { value: String, reason: String },
    #[error("Invalid check interval: must be greater than zero")]
    ZeroCheckInterval,
    #[error(transparent)]
    Schedule(#[from] schedule::Error),
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ConfigFile {
    tether_domains: Option<Vec<String>>,
    tether_cidrs: Option<Vec<String>>,
    route_refresh_cron: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    check_interval: Option<Duration>,
    interfaces: Option<Interfaces>,
    maintenance: Option<Maintenance>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Interfaces {
    primary: Option<Vec<String>>,
    secondary: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Maintenance {
    log_truncate_cron: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            domains: Vec::new(),
            cidrs: Vec::new(),
            primary_keywords: keywords(None, PRIMARY_FALLBACK_KEYWORDS),
            secondary_keywords: keywords(None, SECONDARY_FALLBACK_KEYWORDS),
            refresh_schedule: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            log_truncate_schedule: Schedule::parse(DEFAULT_LOG_TRUNCATE_CRON).ok(),
        }
    }
}

impl TryFrom<ConfigFile> for Config {
    type Error = Error;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let cidrs = file
            .tether_cidrs
            .unwrap_or_default()
            .iter()
            .map(|value| parse_cidr(value))
            .collect::<Result<Vec<_>, _>>()?;

        let domains = file
            .tether_domains
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let refresh_schedule = optional_schedule(file.route_refresh_cron.as_deref())?;

        let log_truncate_schedule = match file.maintenance.and_then(|m| m.log_truncate_cron) {
            Some(expr) => optional_schedule(Some(&expr))?,
            None => Some(Schedule::parse(DEFAULT_LOG_TRUNCATE_CRON)?),
        };

        let check_interval = file.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL);
        if check_interval.is_zero() {
            return Err(Error::ZeroCheckInterval);
        }

        let interfaces = file.interfaces.unwrap_or_default();
        Ok(Config {
            domains,
            cidrs,
            primary_keywords: keywords(interfaces.primary, PRIMARY_FALLBACK_KEYWORDS),
            secondary_keywords: keywords(interfaces.secondary, SECONDARY_FALLBACK_KEYWORDS),
            refresh_schedule,
            check_interval,
            log_truncate_schedule,
        })
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    for key in wrong_keys(&table).iter() {
        tracing::warn!(%key, "ignoring unsupported key in configuration file");
    }
    let file = toml::from_str::<ConfigFile>(content)?;
    file.try_into()
}

fn parse_cidr(value: &str) -> Result<Ipv4Cidr, Error> {
    Ipv4Cidr::from_str(value.trim()).map_err(|e| Error::InvalidCidr {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// An empty expression disables the schedule.
fn optional_schedule(expression: Option<&str>) -> Result<Option<Schedule>, Error> {
    match expression.map(str::trim) {
        None | Some("") => Ok(None),
        Some(expr) => Ok(Some(Schedule::parse(expr)?)),
    }
}

fn keywords(configured: Option<Vec<String>>, fallback: &[&str]) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let candidates = configured
        .unwrap_or_default()
        .into_iter()
        .chain(fallback.iter().map(|s| s.to_string()));
    for keyword in candidates {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() || result.iter().any(|k| k.eq_ignore_ascii_case(&keyword)) {
            continue;
        }
        result.push(keyword);
    }
    result
}

fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let mut wrong_keys = Vec::new();
    for (key, value) in table.iter() {
        match key.as_str() {
            "tether_domains" | "tether_cidrs" | "route_refresh_cron" | "check_interval" => continue,
            "interfaces" => {
                if let Some(interfaces) = value.as_table() {
                    for (k, _v) in interfaces.iter() {
                        if k == "primary" || k == "secondary" {
                            continue;
                        }
                        wrong_keys.push(format!("interfaces.{k}"));
                    }
                }
            }
            "maintenance" => {
                if let Some(maintenance) = value.as_table() {
                    for (k, _v) in maintenance.iter() {
                        if k == "log_truncate_cron" {
                            continue;
                        }
                        wrong_keys.push(format!("maintenance.{k}"));
                    }
                }
            }
            _ => wrong_keys.push(key.clone()),
        }
    }
    wrong_keys
}
