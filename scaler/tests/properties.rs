//! Invariants that must hold across many autoscaling ticks

use gridscale::conf::EngineKind;
use gridscale::models::JobState;
use gridscale::Error;
use gridscale_scaler::TickOutcome;
use gridscale_scaler::libs::hosts::HostStore;
use gridscale_scaler::test_utilities::{self, Harness};
use serial_test::serial;

#[tokio::test]
async fn never_exceeds_host_cap() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 3;
    conf.autoscaler.scale_up_batch_size = 2;
    // far more work than three hosts could ever hold
    let jobs = (1..=20)
        .map(|id| test_utilities::job(&id.to_string(), JobState::Pending, 64, 60))
        .collect();
    harness.engine.set_jobs(jobs).await;
    let autoscaler = harness.autoscaler(&conf).await?;
    for _ in 0..6 {
        autoscaler.tick().await?;
        assert!(harness.elastic.len().await <= 3);
    }
    // we did reach the cap at some point
    assert!(harness.provisioner.cloud().await.runs.len() >= 3);
    Ok(())
}

#[tokio::test]
async fn busy_hosts_are_never_deleted() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Slurm);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 3;
    conf.autoscaler.scale_down_batch_size = 3;
    conf.autoscaler.idle_timeout = 0;
    conf.autoscaler.scale_down_timeout = 0;
    for host in ["pipeline-1", "pipeline-2", "pipeline-3"] {
        harness.elastic.add(host).await?;
        harness
            .elastic
            .touch_at([&host.to_owned()], gridscale_scaler::ago!(600))
            .await?;
    }
    // one host is busy and another gets a job the moment it is disabled
    harness
        .engine
        .set_jobs(vec![
            test_utilities::job("1", JobState::Running, 2, 600).host("pipeline-1"),
        ])
        .await;
    harness
        .engine
        .race_on_disable("pipeline-2", test_utilities::job("2", JobState::Pending, 1, 0))
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    for _ in 0..3 {
        autoscaler.tick().await?;
    }
    let state = harness.engine.state().await;
    let busy = state
        .jobs
        .iter()
        .filter(|job| job.is_running())
        .flat_map(|job| job.hosts.iter())
        .collect::<Vec<&String>>();
    assert!(state.deleted.iter().all(|host| !busy.contains(&host)));
    assert_eq!(state.deleted, vec!["pipeline-3".to_owned()]);
    drop(state);
    assert_eq!(
        harness.elastic.hosts().await,
        vec!["pipeline-1".to_owned(), "pipeline-2".to_owned()]
    );
    Ok(())
}

#[tokio::test]
async fn idle_timeout_boundary() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.idle_timeout = 30;
    conf.autoscaler.scale_down_batch_size = 2;
    harness.elastic.add("pipeline-1").await?;
    harness.elastic.add("pipeline-2").await?;
    // one host is just inside the idle timeout and one is just past it
    harness
        .elastic
        .touch_at([&"pipeline-1".to_owned()], gridscale_scaler::ago!(29))
        .await?;
    harness
        .elastic
        .touch_at([&"pipeline-2".to_owned()], gridscale_scaler::ago!(31))
        .await?;
    let autoscaler = harness.autoscaler(&conf).await?;
    match autoscaler.tick().await? {
        TickOutcome::ScaledDown(retired) => assert_eq!(retired, vec!["pipeline-2".to_owned()]),
        outcome => panic!("expected a scale down, got {outcome:?}"),
    }
    assert!(harness.elastic.contains("pipeline-1").await);
    Ok(())
}

#[tokio::test]
async fn failed_listings_hold_the_pool() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.idle_timeout = 30;
    conf.autoscaler.scale_down_timeout = 0;
    harness.elastic.add("pipeline-1").await?;
    harness
        .elastic
        .touch_at([&"pipeline-1".to_owned()], gridscale_scaler::ago!(600))
        .await?;
    // the host is busy but the engine can't tell us that
    harness
        .engine
        .set_jobs(vec![
            test_utilities::job("1", JobState::Running, 2, 600).host("pipeline-1"),
        ])
        .await;
    harness.engine.state().await.fail_list = true;
    let autoscaler = harness.autoscaler(&conf).await?;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert!(harness.elastic.contains("pipeline-1").await);
    assert!(harness.engine.state().await.disabled.is_empty());
    assert!(harness.engine.state().await.deleted.is_empty());
    // once listing works again the busy host is still kept
    harness.engine.state().await.fail_list = false;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert!(harness.elastic.contains("pipeline-1").await);
    Ok(())
}

#[tokio::test]
async fn huge_timeouts_never_panic() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.idle_timeout = u64::MAX;
    conf.autoscaler.scale_down_timeout = u64::MAX;
    conf.autoscaler.scale_up_timeout = u64::MAX;
    conf.autoscaler.max_hosts = 2;
    harness.elastic.add("pipeline-1").await?;
    harness
        .engine
        .set_jobs(vec![
            test_utilities::job("1", JobState::Running, 2, 60).host("static-1"),
            test_utilities::job("2", JobState::Pending, 2, 60),
        ])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    // nothing has waited or idled long enough
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert!(harness.elastic.contains("pipeline-1").await);
    Ok(())
}

#[tokio::test]
async fn recent_jobs_hold_off_scale_down() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.scale_down_timeout = 60;
    harness.elastic.add("pipeline-1").await?;
    harness
        .elastic
        .touch_at([&"pipeline-1".to_owned()], gridscale_scaler::ago!(600))
        .await?;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Running, 1, 10)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert!(harness.elastic.contains("pipeline-1").await);
    Ok(())
}

#[tokio::test]
async fn full_pool_breaks_deadlocks() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 1;
    // the only host was active a moment ago so the idle timeout would keep it
    harness.elastic.add("pipeline-1").await?;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 4, 60)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    match autoscaler.tick().await? {
        TickOutcome::ScaledDown(retired) => assert_eq!(retired, vec!["pipeline-1".to_owned()]),
        outcome => panic!("expected a scale down, got {outcome:?}"),
    }
    // the next tick can scale up again
    assert!(matches!(autoscaler.tick().await?, TickOutcome::ScaledUp(_)));
    assert_eq!(harness.elastic.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn zero_max_hosts_disables_scale_up() -> Result<(), Error> {
    let harness = Harness::new(EngineKind::Sge);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 0;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 4, 60)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::Steady));
    assert!(harness.provisioner.cloud().await.runs.is_empty());
    assert!(harness.engine.state().await.killed.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn new_workers_are_persisted() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("elastic.hosts");
    let harness = Harness::with_elastic(EngineKind::Sge, HostStore::load(&path).await?);
    let mut conf = test_utilities::conf();
    conf.autoscaler.max_hosts = 2;
    harness
        .engine
        .set_jobs(vec![test_utilities::job("1", JobState::Pending, 2, 60)])
        .await;
    let autoscaler = harness.autoscaler(&conf).await?;
    assert!(matches!(autoscaler.tick().await?, TickOutcome::ScaledUp(_)));
    // a fresh store sees the new worker
    let reloaded = HostStore::load(&path).await?;
    assert_eq!(reloaded.hosts().await, vec!["pipeline-1000".to_owned()]);
    let raw = tokio::fs::read_to_string(&path).await?;
    assert!(raw.starts_with("pipeline-1000\t"));
    Ok(())
}
