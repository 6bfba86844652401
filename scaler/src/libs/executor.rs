//! Runs shell commands for the batch engines and host resolution

use gridscale::Error;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{Level, event, instrument};

/// Something that can run shell commands
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run a command and get its stdout
    ///
    /// A non-zero exit code is an error.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to run
    async fn execute(&self, cmd: &str) -> Result<String, Error>;

    /// Run a command and get its stdout split into non-empty lines
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to run
    async fn execute_to_lines(&self, cmd: &str) -> Result<Vec<String>, Error> {
        let stdout = self.execute(cmd).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// Runs commands on this host with `sh -c`
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    /// Run a command and get its stdout
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to run
    #[instrument(name = "LocalExecutor::execute", skip(self), err(Debug))]
    async fn execute(&self, cmd: &str) -> Result<String, Error> {
        let output = Command::new("sh").arg("-c").arg(cmd).output().await?;
        // non-zero exit codes are execution errors
        if !output.status.success() {
            return Err(Error::execution(
                cmd,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Records commands instead of running them
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor {
    /// The commands that were executed in order
    journal: Arc<Mutex<Vec<String>>>,
    /// Commands starting with any of these prefixes fail
    failing: Arc<Mutex<Vec<String>>>,
}

impl DryRunExecutor {
    /// Get the commands that were executed so far
    pub async fn journal(&self) -> Vec<String> {
        self.journal.lock().await.clone()
    }

    /// Fail any future command that starts with a prefix
    ///
    /// # Arguments
    ///
    /// * `prefix` - The prefix of the commands to fail
    pub async fn fail_on<T: Into<String>>(&self, prefix: T) {
        self.failing.lock().await.push(prefix.into());
    }
}

#[async_trait::async_trait]
impl Executor for DryRunExecutor {
    /// Record a command and return nothing
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to record
    async fn execute(&self, cmd: &str) -> Result<String, Error> {
        event!(Level::DEBUG, dry_run = true, cmd);
        self.journal.lock().await.push(cmd.to_owned());
        let failing = self.failing.lock().await;
        if failing.iter().any(|prefix| cmd.starts_with(prefix.as_str())) {
            return Err(Error::execution(cmd, Some(1), "command failed"));
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_lines() -> Result<(), Error> {
        let lines = LocalExecutor
            .execute_to_lines("printf 'a\\n\\nb\\n'")
            .await?;
        assert_eq!(lines, vec!["a".to_owned(), "b".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn local_failures() {
        match LocalExecutor.execute("echo oops >&2; exit 3").await {
            Err(Error::Execution { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("expected an execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_records() -> Result<(), Error> {
        let executor = DryRunExecutor::default();
        executor.execute("qmod -e main.q@pipeline-1").await?;
        assert_eq!(executor.journal().await, vec!["qmod -e main.q@pipeline-1"]);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_failures() {
        let executor = DryRunExecutor::default();
        executor.fail_on("qstat").await;
        assert!(matches!(
            executor.execute("qstat -f").await,
            Err(Error::Execution { .. })
        ));
        assert!(executor.execute("qmod -d main.q@pipeline-1").await.is_ok());
        // failed commands are still recorded
        assert_eq!(executor.journal().await.len(), 2);
    }
}
