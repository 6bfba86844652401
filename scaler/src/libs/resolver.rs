//! Makes new workers resolvable by editing the hosts file

use gridscale::Error;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::instrument;

use super::executor::Executor;

/// The characters a hostname or ip may contain
static SAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.:_-]*$").expect("host regex is valid"));

/// Make sure a value is safe to put in a shell command
///
/// # Arguments
///
/// * `value` - The value to check
fn check(value: &str) -> Result<&str, Error> {
    if SAFE.is_match(value) {
        Ok(value)
    } else {
        Err(Error::new(format!("Refusing to resolve unsafe name {value:?}")))
    }
}

/// Registers and removes workers in a hosts file
#[derive(Clone)]
pub struct HostsFile {
    /// The hosts file to edit
    path: PathBuf,
    /// The executor to edit our hosts file with
    executor: Arc<dyn Executor>,
}

impl HostsFile {
    /// Create a new hosts file editor
    ///
    /// # Arguments
    ///
    /// * `path` - The hosts file to edit
    /// * `executor` - The executor to edit our hosts file with
    pub fn new<P: Into<PathBuf>>(path: P, executor: Arc<dyn Executor>) -> Self {
        HostsFile {
            path: path.into(),
            executor,
        }
    }

    /// Make a host resolvable
    ///
    /// # Arguments
    ///
    /// * `host` - The hostname to add
    /// * `ip` - The ip this host resolves to
    #[instrument(name = "HostsFile::add", skip(self), err(Debug))]
    pub async fn add(&self, host: &str, ip: &str) -> Result<(), Error> {
        let cmd = format!(
            "printf '%s\\t%s\\n' '{}' '{}' >> '{}'",
            check(ip)?,
            check(host)?,
            self.path.display()
        );
        self.executor.execute(&cmd).await?;
        Ok(())
    }

    /// Remove a host so it no longer resolves
    ///
    /// # Arguments
    ///
    /// * `host` - The hostname to remove
    #[instrument(name = "HostsFile::remove", skip(self), err(Debug))]
    pub async fn remove(&self, host: &str) -> Result<(), Error> {
        // escape any dots so they only match themselves
        let pattern = check(host)?.replace('.', "\\.");
        let cmd = format!(
            "sed -i -E '/[[:space:]]{pattern}([[:space:]]|$)/d' '{}'",
            self.path.display()
        );
        self.executor.execute(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::executor::LocalExecutor;

    #[tokio::test]
    async fn edits_hosts_file() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "127.0.0.1\tlocalhost\n").await?;
        let hosts = HostsFile::new(&path, Arc::new(LocalExecutor));
        hosts.add("pipeline-12", "10.0.0.12").await?;
        hosts.add("pipeline-123", "10.0.0.123").await?;
        hosts.remove("pipeline-12").await?;
        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(contents, "127.0.0.1\tlocalhost\n10.0.0.123\tpipeline-123\n");
        Ok(())
    }

    #[tokio::test]
    async fn rejects_unsafe_names() {
        let hosts = HostsFile::new("/tmp/never-written", Arc::new(LocalExecutor));
        assert!(hosts.add("pipeline-1'; rm -rf /", "10.0.0.1").await.is_err());
        assert!(hosts.remove("$(reboot)").await.is_err());
    }
}
