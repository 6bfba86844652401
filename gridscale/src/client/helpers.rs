//! Helpers for talking to the cloud api

use crate::Error;
use crate::models::InstanceDescriptor;

/// Every response from the cloud api is wrapped in an envelope
#[derive(Deserialize, Debug)]
pub struct Envelope<T> {
    /// Whether this request succeeded
    #[serde(default)]
    pub status: String,
    /// The error message if this request failed
    #[serde(default)]
    pub message: Option<String>,
    /// The data we asked for
    #[serde(default = "Option::default")]
    pub payload: Option<T>,
}

impl<T> Envelope<T> {
    /// Unwrap this envelope into its payload
    ///
    /// # Arguments
    ///
    /// * `code` - The status code this envelope was returned with
    pub fn into_payload(self, code: u16) -> Result<T, Error> {
        // a 2xx can still be a failure if the envelope says so
        if self.status != "OK" {
            return Err(Error::Api {
                code,
                msg: self.message,
            });
        }
        match self.payload {
            Some(payload) => Ok(payload),
            None => Err(Error::Api {
                code,
                msg: Some("Response is missing its payload".to_owned()),
            }),
        }
    }
}

/// An instance type offered in a region
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOffer {
    /// The name of this instance type
    pub name: String,
    /// The number of cpus this instance type has
    #[serde(rename = "vCPU")]
    pub vcpu: u64,
    /// The number of gpus this instance type has
    #[serde(default)]
    pub gpu: u64,
    /// The amount of memory in GiB this instance type has
    pub memory: f64,
}

impl From<InstanceOffer> for InstanceDescriptor {
    fn from(offer: InstanceOffer) -> Self {
        InstanceDescriptor::new(offer.name, offer.vcpu, offer.gpu, offer.memory.floor() as u64)
    }
}

/// The state of a single task within a run
#[derive(Deserialize, Debug, Clone)]
pub struct TaskInfo {
    /// The status of this task
    pub status: crate::models::TaskStatus,
}

/// Send a request and check its status code
#[doc(hidden)]
#[macro_export]
macro_rules! send {
    ($client:expr, $req:expr) => {
        // attempt to send request
        match $client.execute($req.build()?).await {
            // response was received
            Ok(resp) => {
                // check if a response has an error status or not
                if resp.status().is_success() {
                    Ok(resp)
                } else {
                    Err(Error::from_response(resp).await)
                }
            }
            Err(e) => Err(Error::from(e)),
        }
    };
}

/// Send a request and unwrap the payload from its envelope
#[doc(hidden)]
#[macro_export]
macro_rules! send_build {
    ($client:expr, $req:expr, $build:ty) => {
        // attempt to send request
        match $crate::send!($client, $req) {
            Ok(resp) => {
                let code = resp.status().as_u16();
                // attempt to build this response or return an error
                match resp.json::<$crate::client::Envelope<$build>>().await {
                    Ok(envelope) => envelope.into_payload(code),
                    Err(e) => Err(Error::from(e)),
                }
            }
            Err(err) => Err(err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Run, RunStatus};

    #[test]
    fn envelopes() {
        let raw = r#"{"status":"OK","payload":{"id":12,"status":"RUNNING","podId":"pipeline-12","podIP":"10.0.0.4","initialized":true}}"#;
        let envelope: Envelope<Run> = serde_json::from_str(raw).unwrap();
        let run = envelope.into_payload(200).unwrap();
        assert_eq!(run.id, 12);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.network(), Some(("pipeline-12", "10.0.0.4")));
        // an error envelope becomes an api error even with a 200
        let raw = r#"{"status":"ERROR","message":"Run 13 not found"}"#;
        let envelope: Envelope<Run> = serde_json::from_str(raw).unwrap();
        match envelope.into_payload(200) {
            Err(Error::Api { code, msg }) => {
                assert_eq!(code, 200);
                assert_eq!(msg.as_deref(), Some("Run 13 not found"));
            }
            other => panic!("expected an api error, got {other:?}"),
        }
    }

    #[test]
    fn offers() {
        let raw = r#"[{"name":"m5.xlarge","vCPU":4,"memory":16.0},{"name":"p3.2xlarge","vCPU":8,"gpu":1,"memory":61.0}]"#;
        let offers: Vec<InstanceOffer> = serde_json::from_str(raw).unwrap();
        let instances: Vec<InstanceDescriptor> = offers.into_iter().map(Into::into).collect();
        assert_eq!(instances[0], InstanceDescriptor::new("m5.xlarge", 4, 0, 16));
        assert_eq!(instances[1], InstanceDescriptor::new("p3.2xlarge", 8, 1, 61));
    }
}
