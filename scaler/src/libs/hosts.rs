//! Tracks the hosts we manage and when each of them was last active

use chrono::prelude::*;
use gridscale::Error;
use gridscale::models::Job;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{Level, event, instrument};

/// The hosts we manage and when they were last seen doing work
///
/// Every read and write goes through a single lock and file backed stores
/// rewrite their file after every change.
#[derive(Debug)]
pub struct HostStore {
    /// Where this store is persisted if anywhere
    path: Option<PathBuf>,
    /// The hosts in this store and when they were last active
    hosts: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl HostStore {
    /// Create a store that only lives in memory
    #[must_use]
    pub fn in_memory() -> Self {
        HostStore {
            path: None,
            hosts: Mutex::new(BTreeMap::default()),
        }
    }

    /// Load a store from a file creating it if it doesn't exist yet
    ///
    /// # Arguments
    ///
    /// * `path` - The file to persist this store to
    #[instrument(name = "HostStore::load", skip_all, fields(path = %path.as_ref().display()), err(Debug))]
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        // start with no hosts if this file doesn't exist yet
        let hosts = if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            parse(&raw, Utc::now())?
        } else {
            // make sure our parent dir exists so we can write this later
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            BTreeMap::default()
        };
        event!(Level::INFO, hosts = hosts.len());
        Ok(HostStore {
            path: Some(path),
            hosts: Mutex::new(hosts),
        })
    }

    /// Write our hosts to disk if this store is file backed
    ///
    /// # Arguments
    ///
    /// * `hosts` - The locked hosts to write
    async fn persist(&self, hosts: &BTreeMap<String, DateTime<Utc>>) -> Result<(), Error> {
        if let Some(path) = &self.path {
            tokio::fs::write(path, serialize(hosts)).await?;
        }
        Ok(())
    }

    /// Add a new host stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `host` - The host to add
    pub async fn add(&self, host: &str) -> Result<(), Error> {
        let mut hosts = self.hosts.lock().await;
        // a host is never added twice
        if hosts.contains_key(host) {
            return Err(Error::new(format!("Host {host} is already tracked")));
        }
        hosts.insert(host.to_owned(), Utc::now());
        self.persist(&hosts).await
    }

    /// Remove a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to remove
    pub async fn remove(&self, host: &str) -> Result<bool, Error> {
        let mut hosts = self.hosts.lock().await;
        let removed = hosts.remove(host).is_some();
        if removed {
            self.persist(&hosts).await?;
        }
        Ok(removed)
    }

    /// Stamp the activity of any of these hosts we track with the current time
    ///
    /// # Arguments
    ///
    /// * `active` - The hosts that were just seen doing work
    pub async fn touch<'a, I>(&self, active: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.touch_at(active, Utc::now()).await
    }

    /// Stamp the activity of any of these hosts we track
    ///
    /// # Arguments
    ///
    /// * `active` - The hosts that were seen doing work
    /// * `timestamp` - When these hosts were active
    pub async fn touch_at<'a, I>(&self, active: I, timestamp: DateTime<Utc>) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut hosts = self.hosts.lock().await;
        let mut changed = false;
        for host in active {
            // hosts we don't manage are ignored
            if let Some(last) = hosts.get_mut(host) {
                *last = timestamp;
                changed = true;
            }
        }
        if changed {
            self.persist(&hosts).await?;
        }
        Ok(())
    }

    /// Check if we track a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to check
    pub async fn contains(&self, host: &str) -> bool {
        self.hosts.lock().await.contains_key(host)
    }

    /// Get the names of all hosts we track
    pub async fn hosts(&self) -> Vec<String> {
        self.hosts.lock().await.keys().cloned().collect()
    }

    /// Get every host we track and when it was last active
    pub async fn activity(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.hosts.lock().await.clone()
    }

    /// Get the number of hosts we track
    pub async fn len(&self) -> usize {
        self.hosts.lock().await.len()
    }

    /// Whether we track no hosts at all
    pub async fn is_empty(&self) -> bool {
        self.hosts.lock().await.is_empty()
    }
}

/// Get every host that a running job is on
///
/// # Arguments
///
/// * `jobs` - The jobs to check
pub fn running_hosts(jobs: &[Job]) -> BTreeSet<&String> {
    jobs.iter()
        .filter(|job| job.is_running())
        .flat_map(|job| job.hosts.iter())
        .collect()
}

/// Parse the lines of a host store file
///
/// Each line is `hostname\tepoch_seconds` and a missing timestamp means now.
///
/// # Arguments
///
/// * `raw` - The contents of a host store file
/// * `now` - The timestamp to use for hosts without one
fn parse(raw: &str, now: DateTime<Utc>) -> Result<BTreeMap<String, DateTime<Utc>>, Error> {
    let mut hosts = BTreeMap::default();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut split = line.split_whitespace();
        // skip lines that somehow have no host
        let Some(host) = split.next() else {
            continue;
        };
        let timestamp = match split.next() {
            Some(epoch) => match Utc.timestamp_opt(epoch.parse::<i64>()?, 0).single() {
                Some(timestamp) => timestamp,
                None => return Err(Error::new(format!("Invalid timestamp for {host}: {epoch}"))),
            },
            None => now,
        };
        hosts.insert(host.to_owned(), timestamp);
    }
    Ok(hosts)
}

/// Serialize hosts into the host store file format
///
/// # Arguments
///
/// * `hosts` - The hosts to serialize
fn serialize(hosts: &BTreeMap<String, DateTime<Utc>>) -> String {
    hosts
        .iter()
        .map(|(host, last)| format!("{host}\t{}\n", last.timestamp()))
        .collect()
}
