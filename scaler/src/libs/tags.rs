//! Tags each elastic worker's run with whether it is doing work

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Level, event, instrument};

use super::engines::BatchEngine;
use super::hosts::{HostStore, running_hosts};
use super::provisioners::Provisioner;

/// Tags elastic workers in the background
#[derive(Clone)]
pub struct Tagger {
    /// The batch engine to check for running jobs
    engine: Arc<dyn BatchEngine>,
    /// The cloud that owns our workers runs
    provisioner: Arc<dyn Provisioner>,
    /// The elastic hosts we manage
    elastic: Arc<HostStore>,
    /// The tag to set
    tag: String,
}

impl Tagger {
    /// Create a new tagger
    ///
    /// # Arguments
    ///
    /// * `engine` - The batch engine to check for running jobs
    /// * `provisioner` - The cloud that owns our workers runs
    /// * `elastic` - The elastic hosts we manage
    /// * `tag` - The tag to set
    pub fn new(
        engine: Arc<dyn BatchEngine>,
        provisioner: Arc<dyn Provisioner>,
        elastic: Arc<HostStore>,
        tag: String,
    ) -> Self {
        Tagger {
            engine,
            provisioner,
            elastic,
            tag,
        }
    }

    /// Tag every elastic worker without waiting for it to finish
    pub fn spawn(&self) -> JoinHandle<()> {
        let tagger = self.clone();
        tokio::spawn(async move { tagger.tag_all().await })
    }

    /// Tag every elastic worker with whether a running job is on it
    #[instrument(name = "Tagger::tag_all", skip_all)]
    pub async fn tag_all(&self) {
        // keep the old tags if we can't tell which workers are busy
        let jobs = match self.engine.try_list_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                event!(Level::WARN, msg = "Skipping worker tags", error = error.to_string());
                return;
            }
        };
        let active = running_hosts(&jobs);
        for host in self.elastic.hosts().await {
            let Some(run) = self.provisioner.run_of(&host) else {
                continue;
            };
            let value = if active.contains(&host) { "true" } else { "false" };
            if let Err(error) = self.provisioner.tag(run, &self.tag, value).await {
                event!(Level::WARN, msg = "Failed to tag worker", host, run, error = error.to_string());
            }
        }
    }
}
