//! Drives a SLURM cluster

use chrono::prelude::*;
use gridscale::conf::EngineKind;
use gridscale::models::{AllocationRule, Job, JobState, Supply, conversions};
use gridscale::Error;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::BatchEngine;
use crate::libs::executor::Executor;

/// The node states that mark a host as broken
const INVALID_STATES: [&str; 4] = ["DOWN", "FAIL", "NOT_RESPONDING", "UNKNOWN"];

/// Split a line of `scontrol show -o` output into its fields
///
/// Only the first `=` in a token splits the key from the value and tokens
/// without a key continue the value before them.
///
/// # Arguments
///
/// * `line` - The line to split
fn fields(line: &str) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::default();
    let mut last: Option<String> = None;
    for token in line.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) if is_key(key) => {
                map.insert(key.to_owned(), value.to_owned());
                last = Some(key.to_owned());
            }
            _ => {
                // this token is part of a value with spaces in it
                if let Some(value) = last.as_ref().and_then(|key| map.get_mut(key)) {
                    value.push(' ');
                    value.push_str(token);
                }
            }
        }
    }
    map
}

/// Whether a token prefix looks like a field name
///
/// # Arguments
///
/// * `key` - The prefix to check
fn is_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | ':'))
}

/// Map a SLURM job state to a job state
///
/// # Arguments
///
/// * `raw` - The raw SLURM job state
fn state(raw: &str) -> JobState {
    match raw {
        "PENDING" | "CONFIGURING" | "REQUEUED" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "SUSPENDED" | "STOPPED" => JobState::Suspended,
        "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" | "TIMEOUT" | "DEADLINE" => {
            JobState::Error
        }
        "CANCELLED" => JobState::Deleted,
        "COMPLETED" => JobState::Completed,
        _ => JobState::Unknown,
    }
}

/// Parse a SLURM timestamp as local time
///
/// # Arguments
///
/// * `raw` - The raw timestamp
fn timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Expand a SLURM node list like `pipeline-[1-3,5],login` into hostnames
///
/// # Arguments
///
/// * `raw` - The node list to expand
pub fn expand_nodes(raw: &str) -> Vec<String> {
    let mut nodes = Vec::default();
    if raw.is_empty() || raw == "(null)" {
        return nodes;
    }
    // split on the commas that are not inside brackets
    let mut depth = 0;
    let mut start = 0;
    let mut groups = Vec::default();
    for (pos, c) in raw.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                groups.push(&raw[start..pos]);
                start = pos + 1;
            }
            _ => (),
        }
    }
    groups.push(&raw[start..]);
    for group in groups.into_iter().filter(|group| !group.is_empty()) {
        // groups without a range are just a single node
        let (Some(open), Some(close)) = (group.find('['), group.rfind(']')) else {
            nodes.push(group.to_owned());
            continue;
        };
        // a malformed range is kept as is
        if close < open {
            nodes.push(group.to_owned());
            continue;
        }
        let prefix = &group[..open];
        let suffix = &group[close + 1..];
        for range in group[open + 1..close].split(',') {
            match range.split_once('-') {
                Some((first, last)) => {
                    // keep any zero padding
                    let width = first.len();
                    if let (Ok(first), Ok(last)) = (first.parse::<u64>(), last.parse::<u64>()) {
                        for index in first..=last {
                            nodes.push(format!("{prefix}{index:0width$}{suffix}"));
                        }
                    }
                }
                None => nodes.push(format!("{prefix}{range}{suffix}")),
            }
        }
    }
    nodes
}

/// Get the first number in a value like `2` or `2-4`
///
/// # Arguments
///
/// * `raw` - The value to parse
fn leading_number(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<u64>().ok()
}

/// Get the gpu count from a trackable resources value
///
/// # Arguments
///
/// * `tres` - The trackable resources of a job
fn tres_gpus(tres: &HashMap<String, String>) -> u64 {
    tres.iter()
        .filter(|(name, _)| name.starts_with("gres/gpu"))
        .filter_map(|(_, count)| count.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

/// Parse a single line of `scontrol show job -o` into jobs
///
/// Jobs that span N nodes become N jobs with 1/N of the resources each.
///
/// # Arguments
///
/// * `line` - The line to parse
fn parse_job(line: &str) -> Result<Vec<Job>, Error> {
    let fields = fields(line);
    let Some(root) = fields.get("JobId") else {
        return Ok(Vec::default());
    };
    let job_state = state(fields.get("JobState").map(String::as_str).unwrap_or_default());
    // UserId looks like user(uid)
    let user = fields
        .get("UserId")
        .and_then(|raw| raw.split('(').next())
        .unwrap_or_default();
    // running jobs use when they started and everything else when it was submitted
    let started = fields.get("StartTime").and_then(|raw| timestamp(raw));
    let submitted = fields.get("SubmitTime").and_then(|raw| timestamp(raw));
    let datetime = match (job_state, started, submitted) {
        (JobState::Running, Some(started), _) => started,
        (_, _, Some(submitted)) => submitted,
        (_, Some(started), None) => started,
        (_, None, None) => Utc::now(),
    };
    let nodes = fields
        .get("NumNodes")
        .and_then(|raw| leading_number(raw))
        .unwrap_or(1)
        .max(1);
    let cpu = match fields.get("NumCPUs") {
        Some(raw) => leading_number(raw).unwrap_or(1),
        None => 1,
    };
    // trackable resources look like cpu=8,mem=16G,node=2,gres/gpu=2
    let tres: HashMap<String, String> = fields
        .get("TRES")
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect()
        })
        .unwrap_or_default();
    let mem = match tres.get("mem") {
        Some(raw) => conversions::memory(raw)?,
        None => 0,
    };
    let gpu = tres_gpus(&tres);
    let hosts = fields
        .get("NodeList")
        .map(|raw| expand_nodes(raw))
        .unwrap_or_default();
    let name = fields.get("JobName").cloned().unwrap_or_default();
    // build a job for each node this job spans
    let jobs = (0..nodes)
        .map(|index| {
            let id = if nodes > 1 {
                format!("{root}-{index}")
            } else {
                root.clone()
            };
            let mut job = Job::new(id, user, datetime)
                .state(job_state)
                .resources(
                    conversions::split(cpu, nodes),
                    conversions::split(gpu, nodes),
                    conversions::split(mem, nodes),
                )
                .pe("");
            job.root_id = root.clone();
            job.name = name.clone();
            // single node jobs keep every host and split jobs keep their own
            if nodes == 1 {
                job.hosts = hosts.clone();
            } else if let Some(host) = hosts.get(index as usize) {
                job.hosts.push(host.clone());
            }
            job
        })
        .collect();
    Ok(jobs)
}

/// Parse the output of `scontrol show job -o` into jobs
///
/// # Arguments
///
/// * `raw` - The output to parse
pub fn parse_jobs(raw: &str) -> Vec<Job> {
    let mut jobs = Vec::default();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match parse_job(line) {
            Ok(parsed) => jobs.extend(parsed),
            Err(error) => event!(Level::WARN, line, error = error.to_string()),
        }
    }
    jobs
}

/// Parse the output of `scontrol show node -o` into the supply of a host
///
/// # Arguments
///
/// * `raw` - The output to parse
pub fn parse_host_supply(raw: &str) -> Result<Supply, Error> {
    let fields = fields(raw.trim());
    let cpu = match fields.get("CPUTot") {
        Some(raw) => raw.parse::<u64>()?,
        None => 0,
    };
    let mem = match fields.get("RealMemory") {
        Some(raw) => conversions::mib_to_gib(raw.parse::<u64>()?),
        None => 0,
    };
    // gres looks like gpu:2 or gpu:tesla:2(S:0)
    let gpu = fields
        .get("Gres")
        .map(|gres| {
            gres.split(',')
                .filter(|entry| entry.starts_with("gpu"))
                .filter_map(|entry| entry.split('(').next()?.rsplit(':').next()?.parse::<u64>().ok())
                .sum::<u64>()
        })
        .unwrap_or(0);
    Ok(Supply::new(cpu, gpu, mem))
}

/// Check the state of a node in `scontrol show node -o`
///
/// # Arguments
///
/// * `raw` - The output to check
pub fn parse_host_valid(raw: &str) -> bool {
    match fields(raw.trim()).get("State") {
        Some(node_state) => !INVALID_STATES
            .iter()
            .any(|invalid| node_state.contains(invalid)),
        None => false,
    }
}

/// A SLURM cluster
pub struct Slurm {
    /// The executor to run commands with
    executor: Arc<dyn Executor>,
}

impl Slurm {
    /// Create a new SLURM driver
    ///
    /// # Arguments
    ///
    /// * `executor` - The executor to run commands with
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Slurm { executor }
    }

    /// Update the state of a node
    ///
    /// # Arguments
    ///
    /// * `host` - The node to update
    /// * `update` - The state to set
    async fn update(&self, host: &str, update: &str) -> Result<(), Error> {
        self.executor
            .execute(&format!("scontrol update NodeName={host} {update}"))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BatchEngine for Slurm {
    fn kind(&self) -> EngineKind {
        EngineKind::Slurm
    }

    #[instrument(name = "BatchEngine<Slurm>::try_list_jobs", skip_all, err(Debug))]
    async fn try_list_jobs(&self) -> Result<Vec<Job>, Error> {
        let raw = self.executor.execute("scontrol show job -o").await?;
        Ok(parse_jobs(&raw))
    }

    #[instrument(name = "BatchEngine<Slurm>::enable_host", skip(self), err(Debug))]
    async fn enable_host(&self, host: &str) -> Result<(), Error> {
        self.update(host, "State=RESUME").await
    }

    #[instrument(name = "BatchEngine<Slurm>::disable_host", skip(self), err(Debug))]
    async fn disable_host(&self, host: &str) -> Result<(), Error> {
        self.update(host, "State=DRAIN Reason=\"gridscale scale down\"")
            .await
    }

    #[instrument(name = "BatchEngine<Slurm>::delete_host", skip(self), err(Debug))]
    async fn delete_host(&self, host: &str, skip_on_failure: bool) -> Result<(), Error> {
        let steps = [
            format!("scontrol update NodeName={host} State=DOWN Reason=\"gridscale scale down\""),
            format!("scontrol delete NodeName={host}"),
        ];
        for step in &steps {
            if let Err(error) = self.executor.execute(step).await {
                if !skip_on_failure {
                    return Err(error);
                }
                event!(Level::WARN, step, error = error.to_string());
            }
        }
        Ok(())
    }

    async fn host_supply(&self, host: &str) -> Result<Supply, Error> {
        let raw = self
            .executor
            .execute(&format!("scontrol show node {host} -o"))
            .await?;
        parse_host_supply(&raw)
    }

    async fn allocation_rule(&self, _pe: &str) -> Result<AllocationRule, Error> {
        // slurm has no allocation environments
        Ok(AllocationRule::default())
    }

    async fn is_host_valid(&self, host: &str) -> Result<bool, Error> {
        let raw = self
            .executor
            .execute(&format!("scontrol show node {host} -o"))
            .await?;
        Ok(parse_host_valid(&raw))
    }

    #[instrument(name = "BatchEngine<Slurm>::kill_jobs", skip_all, fields(jobs = jobs.len()), err(Debug))]
    async fn kill_jobs(&self, jobs: &[Job], force: bool) -> Result<(), Error> {
        // split jobs are killed through their root job
        let mut ids = jobs
            .iter()
            .map(|job| job.root_id.as_str())
            .collect::<Vec<&str>>();
        ids.dedup();
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.join(" ");
        let cmd = if force {
            format!("scancel --signal=KILL --full {ids}")
        } else {
            format!("scancel {ids}")
        };
        self.executor.execute(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_lists() {
        assert_eq!(
            expand_nodes("pipeline-[1-3,7]"),
            vec!["pipeline-1", "pipeline-2", "pipeline-3", "pipeline-7"]
        );
        assert_eq!(expand_nodes("node[08-10]"), vec!["node08", "node09", "node10"]);
        assert_eq!(
            expand_nodes("login,gpu[1-2]"),
            vec!["login", "gpu1", "gpu2"]
        );
        assert!(expand_nodes("(null)").is_empty());
    }

    #[test]
    fn malformed_node_lists() {
        assert_eq!(expand_nodes("node]1["), vec!["node]1["]);
        assert_eq!(
            expand_nodes("gpu[1-2],bad]3["),
            vec!["gpu1", "gpu2", "bad]3["]
        );
    }

    #[test]
    fn jobs() {
        let raw = "\
JobId=40 JobName=train UserId=alice(1001) GroupId=alice(1001) JobState=RUNNING Reason=None SubmitTime=2024-01-02T10:00:00 StartTime=2024-01-02T10:01:00 NodeList=pipeline-[4-5] NumNodes=2 NumCPUs=8 TRES=cpu=8,mem=16G,node=2,billing=8,gres/gpu=2 Command=/bin/train --epochs 3
JobId=41 JobName=wait UserId=bob(1002) JobState=PENDING Reason=Resources SubmitTime=2024-01-02T10:02:00 StartTime=Unknown NodeList=(null) NumNodes=1-1 NumCPUs=3 TRES=cpu=3,mem=1500M,node=1
JobId=42 JobName=done UserId=bob(1002) JobState=CANCELLED SubmitTime=2024-01-02T10:03:00 NumNodes=1 NumCPUs=1
";
        let jobs = parse_jobs(raw);
        assert_eq!(jobs.len(), 4);
        // the two node job is split into one job per node
        assert_eq!(jobs[0].id, "40-0");
        assert_eq!(jobs[1].id, "40-1");
        assert_eq!(jobs[0].root_id, "40");
        assert_eq!(jobs[0].user, "alice");
        assert_eq!(jobs[0].state, JobState::Running);
        assert_eq!(jobs[0].hosts, vec!["pipeline-4".to_owned()]);
        assert_eq!(jobs[1].hosts, vec!["pipeline-5".to_owned()]);
        assert_eq!((jobs[0].cpu, jobs[0].gpu, jobs[0].mem), (4, 1, 8));
        assert_eq!(jobs[0].datetime, timestamp("2024-01-02T10:01:00").unwrap());
        // pending jobs use their submit time
        assert_eq!(jobs[2].id, "41");
        assert_eq!(jobs[2].state, JobState::Pending);
        assert_eq!(jobs[2].datetime, timestamp("2024-01-02T10:02:00").unwrap());
        assert_eq!((jobs[2].cpu, jobs[2].mem), (3, 2));
        assert!(jobs[2].hosts.is_empty());
        assert_eq!(jobs[3].state, JobState::Deleted);
        // no jobs at all is not an error
        assert!(parse_jobs("No jobs in the system\n").is_empty());
    }

    #[test]
    fn nodes() -> Result<(), Error> {
        let raw = "NodeName=pipeline-4 Arch=x86_64 CoresPerSocket=4 CPUAlloc=0 CPUTot=8 Gres=gpu:tesla:2(S:0) RealMemory=32000 State=IDLE+DRAIN ThreadsPerCore=1";
        assert_eq!(parse_host_supply(raw)?, Supply::new(8, 2, 32));
        assert!(parse_host_valid(raw));
        assert!(!parse_host_valid("NodeName=pipeline-5 State=IDLE+NOT_RESPONDING"));
        assert!(!parse_host_valid("NodeName=pipeline-6 State=DOWN*"));
        Ok(())
    }
}
