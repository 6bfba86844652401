//! Launches workers through the cloud pipeline api

use gridscale::conf::Worker;
use gridscale::models::{InstanceDescriptor, Run, RunRequest, TaskStatus};
use gridscale::{CloudPipeline, Conf, Error};
use std::collections::HashMap;
use tracing::instrument;

use super::Provisioner;

/// Launches workers as runs in the cloud pipeline
pub struct CloudProvisioner {
    /// A client for the cloud pipeline api
    client: CloudPipeline,
    /// The settings to launch workers with
    worker: Worker,
    /// The run our cluster belongs to
    parent_run_id: Option<u64>,
}

impl CloudProvisioner {
    /// Create a new cloud provisioner
    ///
    /// # Arguments
    ///
    /// * `conf` - The gridscale config
    pub fn new(conf: &Conf) -> Result<Self, Error> {
        Ok(CloudProvisioner {
            client: CloudPipeline::new(&conf.cloud)?,
            worker: conf.autoscaler.worker.clone(),
            parent_run_id: conf.cloud.parent_run_id,
        })
    }

    /// Build the request to launch a worker
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type to launch
    /// * `owner` - The user this worker is being launched for
    /// * `params` - Any extra parameters to launch this worker with
    fn request(
        &self,
        instance: &InstanceDescriptor,
        owner: Option<&str>,
        params: &HashMap<String, String>,
    ) -> RunRequest {
        let mut request = RunRequest::new(instance, owner.map(str::to_owned));
        request.parent_run_id = self.parent_run_id;
        request.docker_image = self.worker.docker_image.clone();
        request.cmd_template = self.worker.cmd_template.clone();
        request.hdd_size = self.worker.disk;
        request.is_spot = self.worker.spot;
        // tell the worker which cluster it belongs to
        if let Some(parent) = self.parent_run_id {
            request = request.param("parent_id", parent.to_string());
        }
        request.params.extend(params.clone());
        request
    }
}

#[async_trait::async_trait]
impl Provisioner for CloudProvisioner {
    #[instrument(name = "Provisioner<Cloud>::launch", skip_all, fields(instance = &instance.name), err(Debug))]
    async fn launch(
        &self,
        instance: &InstanceDescriptor,
        owner: Option<&str>,
        params: &HashMap<String, String>,
    ) -> Result<u64, Error> {
        let request = self.request(instance, owner, params);
        let run = self.client.launch(&request).await?;
        Ok(run.id)
    }

    async fn status(&self, run: u64) -> Result<Run, Error> {
        self.client.run(run).await
    }

    async fn task_status(&self, run: u64, task: &str) -> Result<Option<TaskStatus>, Error> {
        self.client.task_status(run, task).await
    }

    async fn stop(&self, run: u64) -> Result<(), Error> {
        self.client.stop(run).await
    }

    async fn instance_types(&self) -> Result<Vec<InstanceDescriptor>, Error> {
        self.client.instance_types().await
    }

    async fn tag(&self, run: u64, key: &str, value: &str) -> Result<(), Error> {
        let mut tags = HashMap::with_capacity(1);
        tags.insert(key.to_owned(), value.to_owned());
        self.client.tag(run, &tags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests() -> Result<(), Error> {
        let mut conf = Conf::default();
        conf.cloud.parent_run_id = Some(9);
        conf.autoscaler.worker.docker_image = Some("library/worker:latest".to_owned());
        conf.autoscaler.worker.spot = true;
        let provisioner = CloudProvisioner::new(&conf)?;
        let instance = InstanceDescriptor::new("m5.xlarge", 4, 0, 16);
        let mut params = HashMap::default();
        params.insert("queue".to_owned(), "main.q".to_owned());
        let request = provisioner.request(&instance, Some("alice"), &params);
        assert_eq!(request.instance_type, "m5.xlarge");
        assert_eq!(request.owner.as_deref(), Some("alice"));
        assert_eq!(request.parent_run_id, Some(9));
        assert!(request.is_spot);
        assert_eq!(request.params["parent_id"], "9");
        assert_eq!(request.params["queue"], "main.q");
        Ok(())
    }
}
