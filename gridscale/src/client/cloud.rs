//! The handler for the cloud pipeline api

use std::collections::HashMap;
use tracing::instrument;

use super::helpers::{InstanceOffer, TaskInfo};
use crate::conf::Cloud;
use crate::models::{InstanceDescriptor, Run, RunRequest, TaskStatus};
use crate::{Error, send, send_build};

/// A client for launching and managing runs in the cloud pipeline api
#[derive(Clone)]
pub struct CloudPipeline {
    /// The url the cloud api can be reached at
    host: String,
    /// The token to authenticate with
    token: String,
    /// The region to list instance types in
    region_id: Option<u64>,
    /// The reqwest client to use
    client: reqwest::Client,
}

impl CloudPipeline {
    /// Create a new cloud pipeline client
    ///
    /// # Arguments
    ///
    /// * `conf` - The cloud api settings
    pub fn new(conf: &Cloud) -> Result<Self, Error> {
        // build a client that gives up on slow requests
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(CloudPipeline {
            host: conf.api.trim_end_matches('/').to_owned(),
            token: conf.token.clone(),
            region_id: conf.region_id,
            client,
        })
    }

    /// Launch a new run
    ///
    /// # Arguments
    ///
    /// * `request` - The run to launch
    #[instrument(name = "CloudPipeline::launch", skip_all, fields(instance = &request.instance_type), err(Debug))]
    pub async fn launch(&self, request: &RunRequest) -> Result<Run, Error> {
        // build request
        let req = self
            .client
            .post(format!("{}/run", self.host))
            .bearer_auth(&self.token)
            .json(request);
        send_build!(self.client, req, Run)
    }

    /// Get the current state of a run
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the run to get
    pub async fn run(&self, id: u64) -> Result<Run, Error> {
        // build request
        let req = self
            .client
            .get(format!("{}/run/{id}", self.host))
            .bearer_auth(&self.token);
        send_build!(self.client, req, Run)
    }

    /// Get the status of a task in a run if that task has started
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the run to check
    /// * `task` - The name of the task to check
    pub async fn task_status(&self, id: u64, task: &str) -> Result<Option<TaskStatus>, Error> {
        // build request
        let req = self
            .client
            .get(format!("{}/run/{id}/task", self.host))
            .query(&[("taskName", task)])
            .bearer_auth(&self.token);
        // a task that has not started yet has no payload
        match send_build!(self.client, req, TaskInfo) {
            Ok(info) => Ok(Some(info.status)),
            Err(Error::Api { code: 200, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Stop a run
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the run to stop
    #[instrument(name = "CloudPipeline::stop", skip(self), err(Debug))]
    pub async fn stop(&self, id: u64) -> Result<(), Error> {
        // build request
        let req = self
            .client
            .post(format!("{}/run/{id}/status", self.host))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({"status": "STOPPED"}));
        send!(self.client, req)?;
        Ok(())
    }

    /// List the instance types that can be launched
    pub async fn instance_types(&self) -> Result<Vec<InstanceDescriptor>, Error> {
        // build request
        let mut req = self
            .client
            .get(format!("{}/cluster/instance/loadAll", self.host))
            .bearer_auth(&self.token);
        // limit our instance types to a region if one was set
        if let Some(region) = self.region_id {
            req = req.query(&[("regionId", region)]);
        }
        let offers = send_build!(self.client, req, Vec<InstanceOffer>)?;
        Ok(offers.into_iter().map(InstanceDescriptor::from).collect())
    }

    /// Set tags on a run
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the run to tag
    /// * `tags` - The tags to set
    pub async fn tag(&self, id: u64, tags: &HashMap<String, String>) -> Result<(), Error> {
        // build request
        let req = self
            .client
            .post(format!("{}/run/{id}/tag", self.host))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "tags": tags }));
        send!(self.client, req)?;
        Ok(())
    }
}
