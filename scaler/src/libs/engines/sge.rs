//! Drives a Sun/Univa/Son of Grid Engine cluster

use chrono::prelude::*;
use gridscale::conf::{Autoscaler, EngineKind};
use gridscale::models::{AllocationRule, Job, JobState, Supply, conversions};
use gridscale::Error;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{Level, event, instrument};

use super::BatchEngine;
use crate::libs::executor::Executor;

/// Matches the queue instance lines in `qstat -f`
static QUEUE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)@(\S+)\s+\S+\s+\d+(?:/\d+)+").expect("queue regex is valid")
});

/// Matches the job lines in `qstat -f`
static JOB_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(\d+)\s+\d+(?:\.\d+)?\s+(\S+)\s+(\S+)\s+(\S+)\s+(\d{2}/\d{2}/\d{4}\s+\d{2}:\d{2}:\d{2})\s+(\d+)(?:\s+(\S+))?\s*$",
    )
    .expect("job regex is valid")
});

/// Matches the labeled detail lines that `qstat -r` adds under each job
static DETAIL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+([A-Za-z][A-Za-z ]*?):\s*(.*)$").expect("detail regex is valid")
});

/// Matches the resource lines that continue a detail section
static RESOURCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+(\w+)=(\S+)").expect("resource regex is valid"));

/// The memory resources we look for in order of preference
const MEMORY_RESOURCES: [&str; 4] = ["mem", "mem_free", "h_vmem", "virtual_free"];

/// The queue states that mark a host as broken
const INVALID_STATES: [char; 4] = ['u', 'E', 'o', 'c'];

/// Map the state letters SGE reports to a job state
///
/// # Arguments
///
/// * `letters` - The state letters for a job
fn state(letters: &str) -> JobState {
    // any job being deleted is deleted regardless of its other letters
    if letters.starts_with('d') {
        return JobState::Deleted;
    }
    match letters {
        "r" | "t" | "Rr" | "Rt" => JobState::Running,
        "qw" | "Rq" | "hqw" | "hRqw" => JobState::Pending,
        "s" | "ts" | "S" | "tS" | "T" | "tT" | "Rs" | "Rts" | "RS" | "RtS" | "RT" | "RtT" => {
            JobState::Suspended
        }
        "Eqw" | "Ehqw" | "EhRqw" => JobState::Error,
        _ => JobState::Unknown,
    }
}

/// Parse an SGE timestamp as local time
///
/// # Arguments
///
/// * `raw` - The raw timestamp in `MM/DD/YYYY HH:MM:SS` form
fn timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
    // collapse any repeated whitespace between the date and time
    let raw = raw.split_whitespace().collect::<Vec<&str>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&raw, "%m/%d/%Y %H:%M:%S")?;
    match Local.from_local_datetime(&naive).earliest() {
        Some(local) => Ok(local.with_timezone(&Utc)),
        None => Err(Error::new(format!("Timestamp {raw} does not exist locally"))),
    }
}

/// A job we are still assembling from `qstat` rows
#[derive(Debug)]
struct Partial {
    /// The job being built
    job: Job,
    /// The slots this job holds across all of its rows
    slots: u64,
    /// The memory in GiB this job requested per slot
    mem_per_slot: u64,
    /// The preference of the memory resource we took our memory from
    mem_rank: Option<usize>,
}

/// Parse the output of `qstat -u "*" -r -f` into jobs
///
/// Rows for the same job on different hosts are merged into one job.
///
/// # Arguments
///
/// * `raw` - The output to parse
pub fn parse_jobs(raw: &str) -> Vec<Job> {
    // the jobs we have found in the order we found them
    let mut partials: Vec<Partial> = Vec::default();
    let mut index: HashMap<String, usize> = HashMap::default();
    // the host the rows we are parsing belong to
    let mut host: Option<String> = None;
    // the job and detail section the lines we are parsing belong to
    let mut current: Option<usize> = None;
    let mut section = String::default();
    for line in raw.lines() {
        // pending jobs are listed after a banner without a queue instance
        if line.contains("PENDING JOBS") {
            host = None;
            current = None;
            continue;
        }
        if let Some(captures) = QUEUE_LINE.captures(line) {
            host = Some(captures[2].to_owned());
            current = None;
            continue;
        }
        if let Some(captures) = JOB_LINE.captures(line) {
            let root = captures[1].to_owned();
            let job_state = state(&captures[4]);
            let slots = captures[6].parse::<u64>().unwrap_or(1);
            // running array tasks are their own jobs
            let id = match (captures.get(7), host.is_some()) {
                (Some(task), true) => format!("{root}.{}", task.as_str()),
                _ => root.clone(),
            };
            // merge this row into a job we already saw on another host
            if let Some(&existing) = index.get(&id) {
                let partial = &mut partials[existing];
                if let Some(host) = &host {
                    if !partial.job.hosts.contains(host) {
                        partial.job.hosts.push(host.clone());
                        partial.slots += slots;
                    }
                }
                current = Some(existing);
                section.clear();
                continue;
            }
            let datetime = match timestamp(&captures[5]) {
                Ok(datetime) => datetime,
                Err(error) => {
                    event!(Level::WARN, job = &id, error = error.to_string());
                    Utc::now()
                }
            };
            let mut job = Job::new(id.clone(), &captures[3], datetime)
                .state(job_state)
                .pe("");
            job.root_id = root;
            job.name = captures[2].to_owned();
            if let Some(host) = &host {
                job.hosts.push(host.clone());
            }
            index.insert(id, partials.len());
            current = Some(partials.len());
            section.clear();
            partials.push(Partial {
                job,
                slots,
                mem_per_slot: 0,
                mem_rank: None,
            });
            continue;
        }
        // everything else is detail about the current job
        let Some(current) = current else {
            continue;
        };
        let partial = &mut partials[current];
        if let Some(captures) = DETAIL_LINE.captures(line) {
            section = captures[1].to_owned();
            let value = captures[2].trim();
            match section.as_str() {
                "Full jobname" => partial.job.name = value.to_owned(),
                "Requested PE" => {
                    if let Some(pe) = value.split_whitespace().next() {
                        partial.job.pe = pe.to_owned();
                    }
                }
                "Hard Resources" => apply_resource(partial, value),
                _ => (),
            }
        } else if section == "Hard Resources" && RESOURCE_LINE.is_match(line) {
            apply_resource(partial, line.trim());
        }
    }
    // finish building our jobs
    partials
        .into_iter()
        .map(|partial| {
            let Partial {
                mut job,
                slots,
                mem_per_slot,
                ..
            } = partial;
            job.cpu = slots.max(1);
            job.mem = mem_per_slot * job.cpu;
            job
        })
        .collect()
}

/// Apply a single `name=value (...)` hard resource to a partial job
///
/// # Arguments
///
/// * `partial` - The job to apply this resource to
/// * `raw` - The raw resource
fn apply_resource(partial: &mut Partial, raw: &str) {
    let padded = format!(" {raw}");
    let Some(captures) = RESOURCE_LINE.captures(&padded) else {
        return;
    };
    let (name, value) = (&captures[1], &captures[2]);
    if name == "gpus" || name == "gpu" {
        partial.job.gpu = value.parse::<u64>().unwrap_or(0);
        return;
    }
    // only take the most preferred memory resource
    if let Some(rank) = MEMORY_RESOURCES.iter().position(|mem| *mem == name) {
        if partial.mem_rank.is_some_and(|current| current <= rank) {
            return;
        }
        match conversions::memory(value) {
            Ok(mem) => {
                partial.mem_per_slot = mem;
                partial.mem_rank = Some(rank);
            }
            Err(error) => event!(Level::WARN, job = &partial.job.id, error = error.to_string()),
        }
    }
}

/// Parse the output of `qconf -se` into the supply of a host
///
/// # Arguments
///
/// * `raw` - The output to parse
pub fn parse_host_supply(raw: &str) -> Result<Supply, Error> {
    // join any lines continued with a backslash
    let joined = raw.replace("\\\n", "");
    let mut fields: HashMap<&str, &str> = HashMap::default();
    for line in joined.lines() {
        if let Some((key, value)) = line.trim().split_once(char::is_whitespace) {
            fields.insert(key, value.trim());
        }
    }
    // split a comma separated list of key=value pairs
    let pairs = |key: &str| -> HashMap<String, String> {
        fields
            .get(key)
            .map(|values| {
                values
                    .split(',')
                    .filter_map(|pair| pair.trim().split_once('='))
                    .map(|(name, value)| (name.to_owned(), value.to_owned()))
                    .collect()
            })
            .unwrap_or_default()
    };
    let load = pairs("load_values");
    let complexes = pairs("complex_values");
    // prefer the reported cpu count but fall back to the processors field
    let cpu = match (load.get("num_proc"), fields.get("processors")) {
        (Some(num_proc), _) => num_proc.parse::<f64>()? as u64,
        (None, Some(processors)) => processors.parse::<u64>()?,
        (None, None) => 0,
    };
    let mem = match load.get("mem_total") {
        Some(mem_total) => conversions::memory(mem_total)?,
        None => 0,
    };
    let gpu = match complexes.get("gpus") {
        Some(gpus) => gpus.parse::<u64>()?,
        None => 0,
    };
    Ok(Supply::new(cpu, gpu, mem))
}

/// Check the state column for a queue instance in `qstat -f -q`
///
/// # Arguments
///
/// * `raw` - The output to check
/// * `instance` - The `queue@host` instance to find
pub fn parse_host_valid(raw: &str, instance: &str) -> bool {
    for line in raw.lines() {
        let mut columns = line.split_whitespace();
        if columns.next() != Some(instance) {
            continue;
        }
        // queuename qtype resv/used/tot load_avg arch states
        return match columns.nth(4) {
            Some(states) => !states.chars().any(|letter| INVALID_STATES.contains(&letter)),
            None => true,
        };
    }
    false
}

/// A grid engine cluster
pub struct Sge {
    /// The queue workers are added to
    queue: String,
    /// The hostgroup workers are added to
    hostgroup: String,
    /// The executor to run commands with
    executor: Arc<dyn Executor>,
}

impl Sge {
    /// Create a new grid engine driver
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `executor` - The executor to run commands with
    pub fn new(conf: &Autoscaler, executor: Arc<dyn Executor>) -> Self {
        Sge {
            queue: conf.queue.clone(),
            hostgroup: conf.hostgroup.clone(),
            executor,
        }
    }

    /// Get the queue instance for a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to get a queue instance for
    fn instance(&self, host: &str) -> String {
        format!("{}@{host}", self.queue)
    }
}

#[async_trait::async_trait]
impl BatchEngine for Sge {
    fn kind(&self) -> EngineKind {
        EngineKind::Sge
    }

    #[instrument(name = "BatchEngine<Sge>::try_list_jobs", skip_all, err(Debug))]
    async fn try_list_jobs(&self) -> Result<Vec<Job>, Error> {
        let raw = self.executor.execute("qstat -u \"*\" -r -f").await?;
        Ok(parse_jobs(&raw))
    }

    #[instrument(name = "BatchEngine<Sge>::enable_host", skip(self), err(Debug))]
    async fn enable_host(&self, host: &str) -> Result<(), Error> {
        self.executor
            .execute(&format!("qmod -e {}", self.instance(host)))
            .await?;
        Ok(())
    }

    #[instrument(name = "BatchEngine<Sge>::disable_host", skip(self), err(Debug))]
    async fn disable_host(&self, host: &str) -> Result<(), Error> {
        self.executor
            .execute(&format!("qmod -d {}", self.instance(host)))
            .await?;
        Ok(())
    }

    #[instrument(name = "BatchEngine<Sge>::delete_host", skip(self), err(Debug))]
    async fn delete_host(&self, host: &str, skip_on_failure: bool) -> Result<(), Error> {
        let steps = [
            // shutdown the execution daemon
            format!("qconf -ke {host}"),
            // remove this host from our queue
            format!("qconf -purge queue slots {}", self.instance(host)),
            // remove this host from our hostgroup
            format!("qconf -dattr hostgroup hostlist {host} {}", self.hostgroup),
            // remove this host from the admin hosts
            format!("qconf -dh {host}"),
            // remove this host from the execution hosts
            format!("qconf -de {host}"),
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
        let raw = self.executor.execute(&format!("qconf -se {host}")).await?;
        parse_host_supply(&raw)
    }

    async fn allocation_rule(&self, pe: &str) -> Result<AllocationRule, Error> {
        // jobs without an allocation environment are placed on a single host
        if pe.is_empty() {
            return Ok(AllocationRule::default());
        }
        let lines = self
            .executor
            .execute_to_lines(&format!("qconf -sp {pe}"))
            .await?;
        let rule = lines
            .iter()
            .find_map(|line| line.trim().strip_prefix("allocation_rule"))
            .and_then(|raw| raw.trim().parse::<AllocationRule>().ok())
            .unwrap_or_default();
        Ok(rule)
    }

    async fn is_host_valid(&self, host: &str) -> Result<bool, Error> {
        let instance = self.instance(host);
        let raw = self
            .executor
            .execute(&format!("qstat -f -q {instance}"))
            .await?;
        Ok(parse_host_valid(&raw, &instance))
    }

    #[instrument(name = "BatchEngine<Sge>::kill_jobs", skip_all, fields(jobs = jobs.len()), err(Debug))]
    async fn kill_jobs(&self, jobs: &[Job], force: bool) -> Result<(), Error> {
        if jobs.is_empty() {
            return Ok(());
        }
        let ids = jobs
            .iter()
            .map(|job| job.id.as_str())
            .collect::<Vec<&str>>()
            .join(" ");
        let cmd = if force {
            format!("qdel -f {ids}")
        } else {
            format!("qdel {ids}")
        };
        self.executor.execute(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT: &str = "\
queuename                      qtype resv/used/tot. load_avg arch          states
---------------------------------------------------------------------------------
main.q@pipeline-11             BIP   0/4/4          0.50     lx-amd64
     17 0.55500 mpi.sh     alice        r     01/02/2024 10:00:00     4
       Full jobname:     mpi.sh
       Master Queue:     main.q@pipeline-11
       Hard Resources:   mem=2G (0.000000)
                         gpus=1 (0.000000)
       Soft Resources:
       Requested PE:     mpi 8
       Granted PE:       mpi 8
---------------------------------------------------------------------------------
main.q@pipeline-12             BIP   0/4/4          0.50     lx-amd64      d
     17 0.55500 mpi.sh     alice        r     01/02/2024 10:00:00     4
       Full jobname:     mpi.sh
       Requested PE:     mpi 8
     18 0.50000 array      bob          r     01/02/2024 10:01:00     1 3

############################################################################
 - PENDING JOBS - PENDING JOBS - PENDING JOBS - PENDING JOBS - PENDING JOBS
############################################################################
     19 0.00000 a_very_lon carol        qw    01/02/2024 10:05:00     2
       Full jobname:     a_very_long_job_name
       Hard Resources:   mem_free=1.5G (0.000000)
       Requested PE:     local 2
     20 0.00000 broken     dave         Eqw   01/02/2024 10:06:00     1
     21 0.00000 gone       erin         dqw   01/02/2024 10:07:00     1
";

    #[test]
    fn jobs() {
        let jobs = parse_jobs(QSTAT);
        assert_eq!(jobs.len(), 5);
        // the mpi job spans two hosts and is merged
        let mpi = &jobs[0];
        assert_eq!(mpi.id, "17");
        assert_eq!(mpi.user, "alice");
        assert_eq!(mpi.state, JobState::Running);
        assert_eq!(mpi.hosts, vec!["pipeline-11".to_owned(), "pipeline-12".to_owned()]);
        assert_eq!(mpi.cpu, 8);
        assert_eq!(mpi.mem, 16);
        assert_eq!(mpi.gpu, 1);
        assert_eq!(mpi.pe, "mpi");
        // running array tasks get their own id
        let array = &jobs[1];
        assert_eq!(array.id, "18.3");
        assert_eq!(array.root_id, "18");
        assert_eq!(array.hosts, vec!["pipeline-12".to_owned()]);
        assert_eq!(array.pe, "");
        // pending jobs have no hosts and use their full name
        let pending = &jobs[2];
        assert_eq!(pending.name, "a_very_long_job_name");
        assert_eq!(pending.state, JobState::Pending);
        assert!(pending.hosts.is_empty());
        assert_eq!(pending.cpu, 2);
        assert_eq!(pending.mem, 4);
        assert_eq!(pending.pe, "local");
        assert_eq!(jobs[3].state, JobState::Error);
        assert_eq!(jobs[4].state, JobState::Deleted);
    }

    #[test]
    fn states() {
        assert_eq!(state("hqw"), JobState::Pending);
        assert_eq!(state("Rr"), JobState::Running);
        assert_eq!(state("RtS"), JobState::Suspended);
        assert_eq!(state("dr"), JobState::Deleted);
        assert_eq!(state("zz"), JobState::Unknown);
    }

    #[test]
    fn host_supply() -> Result<(), Error> {
        let raw = "\
hostname              pipeline-11
load_scaling          NONE
complex_values        gpus=2
load_values           arch=lx-amd64,num_proc=16,mem_total=63312.265625M, \\
                      swap_total=0.000000M
processors            16
";
        assert_eq!(parse_host_supply(raw)?, Supply::new(16, 2, 62));
        let bare = "hostname pipeline-12\ncomplex_values NONE\nprocessors 4\n";
        assert_eq!(parse_host_supply(bare)?, Supply::new(4, 0, 0));
        Ok(())
    }

    #[test]
    fn host_validity() {
        let healthy = "\
queuename                      qtype resv/used/tot. load_avg arch          states
---------------------------------------------------------------------------------
main.q@pipeline-11             BIP   0/0/4          0.01     lx-amd64
";
        let disabled = "main.q@pipeline-11 BIP 0/0/4 0.01 lx-amd64 d\n";
        let unknown = "main.q@pipeline-11 BIP 0/0/4 -NA- lx-amd64 au\n";
        assert!(parse_host_valid(healthy, "main.q@pipeline-11"));
        assert!(parse_host_valid(disabled, "main.q@pipeline-11"));
        assert!(!parse_host_valid(unknown, "main.q@pipeline-11"));
        assert!(!parse_host_valid(healthy, "main.q@pipeline-99"));
    }
}
