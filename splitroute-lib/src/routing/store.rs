//! Persistence of the routed target set.
//!
//! The last applied set is written to disk so a later clear, possibly from a new
//! process, can remove exactly what was installed.
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE: &str = "routed_targets.yaml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Everything that is routed via the secondary interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTargetSet {
    #[serde(default)]
    pub ips: Vec<Ipv4Addr>,
    #[serde(default)]
    pub cidrs: Vec<Ipv4Cidr>,
}

impl RoutingTargetSet {
    pub fn new(cidrs: Vec<Ipv4Cidr>) -> Self {
        RoutingTargetSet { ips: Vec::new(), cidrs }
    }

    pub fn len(&self) -> usize {
        self.ips.len() + self.cidrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.cidrs.is_empty()
    }

    pub fn contains_ip(&self, ip: &Ipv4Addr) -> bool {
        self.ips.contains(ip)
    }

    /// CIDR blocks first, then single hosts as `/32` targets.
    pub fn targets(&self) -> impl Iterator<Item = Ipv4Cidr> + '_ {
        self.cidrs
            .iter()
            .copied()
            .chain(self.ips.iter().map(|ip| Ipv4Cidr::new_host(*ip)))
    }
}

#[derive(Clone, Debug)]
pub struct TargetStore {
    path: PathBuf,
}

impl TargetStore {
    pub fn new(path: PathBuf) -> Self {
        TargetStore { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the set through a temporary sibling file, a crash never leaves a torn file.
    pub async fn store(&self, set: &RoutingTargetSet) -> Result<(), Error> {
        let content = serde_yaml::to_string(set)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), targets = set.len(), "stored routed targets");
        Ok(())
    }

    /// `None` when nothing was persisted.
    pub async fn load(&self) -> Result<Option<RoutingTargetSet>, Error> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let set = serde_yaml::from_str::<RoutingTargetSet>(&content)?;
        Ok(Some(set))
    }

    /// Returns whether a file was actually removed.
    pub async fn remove(&self) -> Result<bool, Error> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample() -> anyhow::Result<RoutingTargetSet> {
        Ok(RoutingTargetSet {
            ips: vec![Ipv4Addr::new(93, 184, 216, 34)],
            cidrs: vec![Ipv4Cidr::from_str("10.0.0.0/8")?],
        })
    }

    #[tokio::test]
    async fn load_without_file_returns_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::new(dir.path().join(DEFAULT_FILE));
        assert_eq!(store.load().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn stored_set_loads_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::new(dir.path().join("nested").join(DEFAULT_FILE));
        let set = sample()?;

        store.store(&set).await?;

        assert_eq!(store.load().await?, Some(set));
        assert!(!dir.path().join("nested").join("routed_targets.yaml.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn store_overwrites_previous_set() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::new(dir.path().join(DEFAULT_FILE));
        store.store(&sample()?).await?;

        let replacement = RoutingTargetSet {
            ips: vec![Ipv4Addr::new(1, 1, 1, 1)],
            cidrs: Vec::new(),
        };
        store.store(&replacement).await?;

        assert_eq!(store.load().await?, Some(replacement));
        Ok(())
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::new(dir.path().join(DEFAULT_FILE));
        store.store(&sample()?).await?;

        assert!(store.remove().await?);
        assert!(!store.remove().await?);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(DEFAULT_FILE);
        fs::write(&path, "ips: [not-an-ip]").await?;

        let res = TargetStore::new(path).load().await;
        assert!(matches!(res, Err(Error::Serialization(_))));
        Ok(())
    }

    #[test]
    fn targets_list_cidrs_before_hosts() -> anyhow::Result<()> {
        let targets = sample()?.targets().map(|t| super::super::target_string(&t)).collect::<Vec<_>>();
        assert_eq!(targets, vec!["10.0.0.0/8", "93.184.216.34/32"]);
        Ok(())
    }
}
