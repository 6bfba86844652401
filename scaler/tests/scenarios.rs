//! End to end autoscaling scenarios against a dry run cluster

use gridscale::conf::EngineKind;
use gridscale::models::{AllocationRule, JobState, RunStatus, Supply};
use gridscale::Error;
use gridscale_scaler::libs::engines::{AllocationRules, Sge};
use gridscale_scaler::libs::hosts::HostStore;
use gridscale_scaler::libs::resolver::HostsFile;
use gridscale_scaler::libs::scale_down::{Retirement, ScaleDownHandler};
use gridscale_scaler::libs::scale_up::{Worker, WorkerState};
use gridscale_scaler::{DryRunExecutor, DryRunProvisioner, TickOutcome};
use std::sync::Arc;
use gridscale_scaler::libs::validator::{Ceilings, JobValidator};
use gridscale_scaler::test_utilities::{self, Harness};

#[tokio::test]
async fn scale_up_for_waiting_jobs() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 5;
    conf.autoscaler.scale_up_batch_size = 5;
    // three jobs that have waited longer than the scale up timeout
    harness
        .engine
        .set_jobs(vec![
            test_utilities::job("1", JobState::Pending, 4, 40),
            test_utilities::job("2", JobState::Pending, 4, 40),
            test_utilities::job("3", JobState::Pending, 4, 40),
        ])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    let before = chrono::Utc::now();
    let workers = match autoscaler.tick().await? {
        TickOutcome::ScaledUp(workers) => workers,
        outcome => panic!("expected a scale up, got {outcome:?}"),
    };
    // all three jobs fit on a single worker
    assert_eq!(workers.len(), 1);
    let worker = &workers[0];
    assert_eq!(
        worker.history,
        vec![
            WorkerState::Requested,
            WorkerState::Launched,
            WorkerState::PodPending,
            WorkerState::PodRunning,
            WorkerState::HostLinked,
            WorkerState::WorkerInitialized,
            WorkerState::EngineEnabled,
        ]
    );
    assert_eq!(worker.demand.instance.name, "m5.4xlarge");
    // the new worker is tracked with a fresh timestamp
    let activity = harness.elastic.activity().await;
    assert_eq!(activity.len(), 1);
    let host = worker.host.clone().unwrap();
    assert!(activity[&host] >= before);
    // the worker was made resolvable and enabled
    assert!(harness.engine.state().await.enabled.contains(&host));
    let journal = harness.executor.journal().await;
    assert!(journal.iter().any(|cmd| cmd.contains(&host) && cmd.contains(">>")));
    Ok(())
}

#[tokio::test]
async fn scale_down_idle_host() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.scale_down_timeout = 60;
    conf.autoscaler.idle_timeout = 30;
    // a single running job that started a while ago on a static host
    harness.statics.add("static-1").await?;
    harness
        .engine
        .set_jobs(vec![
            test_utilities::job("1", JobState::Running, 2, 120).host("static-1"),
        ])
        .await;
    // an elastic host that has been idle for 90 seconds
    harness.elastic.add("pipeline-7").await?;
    harness
        .elastic
        .touch_at([&"pipeline-7".to_owned()], gridscale_scaler::ago!(90))
        .await?;
    let autoscaler = harness.autoscaler(&conf).await?;
    match autoscaler.tick().await? {
        TickOutcome::ScaledDown(retired) => assert_eq!(retired, vec!["pipeline-7".to_owned()]),
        outcome => panic!("expected a scale down, got {outcome:?}"),
    }
    assert!(harness.elastic.is_empty().await);
    assert_eq!(harness.engine.state().await.deleted, vec!["pipeline-7".to_owned()]);
    assert_eq!(harness.provisioner.cloud().await.stopped, vec![7]);
    // the static host is never touched
    assert!(harness.statics.contains("static-1").await);
    Ok(())
}

#[tokio::test]
async fn scale_down_races_with_new_job() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let conf = test_utilities::conf();
    harness.elastic.add("pipeline-9").await?;
    // a job lands on this host right as it is disabled
    harness
        .engine
        .race_on_disable("pipeline-9", test_utilities::job("5", JobState::Pending, 1, 0))
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    let retirement = autoscaler.retire().scale_down("pipeline-9").await?;
    assert_eq!(retirement, Retirement::NotRetired);
    // the host is back in service and still tracked
    let state = harness.engine.state().await;
    assert_eq!(state.enabled, vec!["pipeline-9".to_owned()]);
    assert!(state.deleted.is_empty());
    assert!(!state.disabled.contains("pipeline-9"));
    drop(state);
    assert!(harness.elastic.contains("pipeline-9").await);
    assert!(harness.provisioner.cloud().await.stopped.is_empty());
    Ok(())
}

#[tokio::test]
async fn oversized_jobs_are_killed() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let jobs = vec![
        test_utilities::job("1", JobState::Pending, 256, 40),
        test_utilities::job("2", JobState::Pending, 64, 40),
    ];
    let validator = JobValidator::new(harness.engine.clone());
    let ceilings = Ceilings::new(&test_utilities::instances(), Supply::default(), 5);
    let (valid, invalid) = validator
        .validate(jobs, &AllocationRules::default(), &ceilings)
        .await;
    assert_eq!(valid.iter().map(|job| job.id.as_str()).collect::<Vec<_>>(), vec!["2"]);
    assert_eq!(invalid.iter().map(|job| job.id.as_str()).collect::<Vec<_>>(), vec!["1"]);
    assert_eq!(harness.engine.state().await.killed, vec!["1".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn oversized_jobs_never_scale_up() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 5;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 256, 40)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert_eq!(harness.engine.state().await.killed, vec!["1".to_owned()]);
    assert!(harness.elastic.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn fractional_jobs_use_idle_capacity() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 5;
    // a static host with half of its cpus in use
    harness.statics.add("static-1").await?;
    harness.engine.set_supply("static-1", Supply::new(16, 0, 64)).await;
    harness.engine.set_rule("mpi", AllocationRule::FillUp).await;
    harness
        .engine
        .set_jobs(vec![
            test_utilities::job("1", JobState::Running, 8, 200).host("static-1"),
            test_utilities::job("2", JobState::Pending, 12, 40).pe("mpi"),
        ])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    let workers = match autoscaler.tick().await? {
        TickOutcome::ScaledUp(workers) => workers,
        outcome => panic!("expected a scale up, got {outcome:?}"),
    };
    // only the 4 cpus the static host can't cover are launched
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].demand.instance.name, "m5.xlarge");
    Ok(())
}

#[tokio::test]
async fn young_jobs_do_not_scale_up() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Slurm);
    let conf = test_utilities::conf();
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 4, 5)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert!(harness.provisioner.cloud().await.runs.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_launches_are_dropped() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 5;
    harness.provisioner.fail_launches("m5.xlarge").await;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 4, 40)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    let workers = match autoscaler.tick().await? {
        TickOutcome::ScaledUp(workers) => workers,
        outcome => panic!("expected a scale up, got {outcome:?}"),
    };
    assert_eq!(workers[0].state, WorkerState::Failed);
    assert!(harness.elastic.is_empty().await);
    // the failed instance type is skipped next time
    let workers = match autoscaler.tick().await? {
        TickOutcome::ScaledUp(workers) => workers,
        outcome => panic!("expected a scale up, got {outcome:?}"),
    };
    assert_eq!(workers[0].state, WorkerState::EngineEnabled);
    assert_eq!(workers[0].demand.instance.name, "m5.2xlarge");
    Ok(())
}

#[tokio::test]
async fn failed_enables_unlink_the_worker() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 5;
    // the first run we launch will never enable
    harness
        .engine
        .state()
        .await
        .fail_enable
        .insert("pipeline-1000".to_owned());
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 4, 40)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    let workers = match autoscaler.tick().await? {
        TickOutcome::ScaledUp(workers) => workers,
        outcome => panic!("expected a scale up, got {outcome:?}"),
    };
    let worker = &workers[0];
    assert_eq!(worker.state, WorkerState::Failed);
    assert!(worker.history.contains(&WorkerState::HostLinked));
    // the optimistic links were undone
    assert!(harness.elastic.is_empty().await);
    let journal = harness.executor.journal().await;
    assert!(journal.iter().any(|cmd| cmd.starts_with("sed") && cmd.contains("pipeline-1000")));
    Ok(())
}

#[tokio::test]
async fn failed_recheck_keeps_the_host() -> Result<(), Error> {
    let conf = test_utilities::conf();
    // the engine can disable hosts but can't list jobs
    let executor = Arc::new(DryRunExecutor::default());
    executor.fail_on("qstat").await;
    let engine = Arc::new(Sge::new(&conf.autoscaler, executor.clone()));
    let provisioner = Arc::new(DryRunProvisioner::new(test_utilities::instances()));
    let hosts_file = Arc::new(HostsFile::new(&conf.autoscaler.hosts_file, executor.clone()));
    let elastic = Arc::new(HostStore::in_memory());
    elastic.add("pipeline-5").await?;
    let handler = ScaleDownHandler::new(engine, provisioner.clone(), hosts_file, elastic.clone());
    let retirement = handler.scale_down("pipeline-5").await?;
    assert_eq!(retirement, Retirement::NotRetired);
    // the host was put back into service and nothing was torn down
    let journal = executor.journal().await;
    assert!(journal[0].starts_with("qmod -d"));
    assert!(journal[1].starts_with("qstat"));
    assert!(journal[2].starts_with("qmod -e"));
    assert_eq!(journal.len(), 3);
    assert!(elastic.contains("pipeline-5").await);
    assert!(provisioner.cloud().await.stopped.is_empty());
    Ok(())
}

/// Run a single tick that must scale up and get the only worker
///
/// # Arguments
///
/// * `harness` - The harness to tick
async fn single_worker(harness: &Harness) -> Result<Worker, Error> {
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 5;
    // a single poll per stage
    conf.autoscaler.scale_up_polling_timeout = 1;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 4, 40)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    let mut workers = match autoscaler.tick().await? {
        TickOutcome::ScaledUp(workers) => workers,
        outcome => panic!("expected a scale up, got {outcome:?}"),
    };
    assert_eq!(workers.len(), 1);
    Ok(workers.remove(0))
}

#[tokio::test]
async fn unnetworked_runs_fail() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    harness.provisioner.cloud().await.network_polls = 3;
    let worker = single_worker(&harness).await?;
    assert_eq!(worker.state, WorkerState::Failed);
    assert!(worker.host.is_none());
    assert!(!worker.history.contains(&WorkerState::PodRunning));
    // nothing was linked so nothing changed
    assert!(harness.elastic.is_empty().await);
    assert!(harness.executor.journal().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn runs_stopping_while_pending_fail() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Slurm);
    harness.provisioner.cloud().await.launch_status = RunStatus::Failure;
    let worker = single_worker(&harness).await?;
    assert_eq!(worker.state, WorkerState::Failed);
    assert!(worker.history.contains(&WorkerState::PodPending));
    assert!(!worker.history.contains(&WorkerState::PodRunning));
    assert!(harness.elastic.is_empty().await);
    assert!(harness.executor.journal().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn uninitialized_workers_are_unlinked() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    harness.provisioner.cloud().await.init_polls = 3;
    let worker = single_worker(&harness).await?;
    assert_eq!(worker.state, WorkerState::Failed);
    assert!(worker.history.contains(&WorkerState::HostLinked));
    assert!(!worker.history.contains(&WorkerState::WorkerInitialized));
    // the worker was linked and then unlinked
    assert!(harness.elastic.is_empty().await);
    let journal = harness.executor.journal().await;
    assert_eq!(journal.len(), 2);
    assert!(journal[0].contains(">>") && journal[0].contains("pipeline-1000"));
    assert!(journal[1].starts_with("sed") && journal[1].contains("pipeline-1000"));
    assert!(!harness.engine.state().await.enabled.contains(&"pipeline-1000".to_owned()));
    Ok(())
}
