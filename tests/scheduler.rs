mod common;

use common::{
    is_finished, next_started, open_store, wait_events, wait_for_state, GatedEvaluator,
};
use sea_orm::ConnectionTrait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stratopt::commands::{dispatch, AppCommand};
use stratopt::events::OptimizerEvent;
use stratopt::optimize::model::{JobRequest, JobState, ValidationError};
use stratopt::optimize::scheduler::{JobScheduler, ResumePolicy, SchedulerConfig, SchedulerError};
use stratopt::optimize::space::ParamSpace;
use tempfile::TempDir;

fn one_point() -> ParamSpace {
    ParamSpace::grid([("x", vec![json!(1)])])
}

fn points(n: usize) -> ParamSpace {
    ParamSpace::grid([("x", (0..n).map(|v| json!(v)).collect())])
}

fn job(id: &str, priority: i32) -> JobRequest {
    JobRequest::optimize(id, one_point(), 10)
        .with_id(id)
        .priority(priority)
}

fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        max_queue_depth: 100,
        ..Default::default()
    }
}

async fn setup(
    dir: &TempDir,
    cfg: SchedulerConfig,
) -> (
    JobScheduler,
    Arc<GatedEvaluator>,
    tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let store = open_store(dir).await;
    let (ev, started) = GatedEvaluator::new();
    let scheduler = JobScheduler::new(cfg, store, ev.clone());
    (scheduler, ev, started)
}

#[tokio::test]
async fn higher_priority_runs_first() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, mut started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("blocker", 0)).await.unwrap();
    assert_eq!(next_started(&mut started).await, "blocker");

    scheduler.schedule(job("A", 1)).await.unwrap();
    scheduler.schedule(job("B", 5)).await.unwrap();
    scheduler.schedule(job("C", 3)).await.unwrap();
    assert_eq!(scheduler.get_status().queue_depth, 3);

    ev.open();
    wait_events(&mut events, 4, is_finished).await;
    assert_eq!(ev.strategies(), vec!["blocker", "B", "C", "A"]);
}

#[tokio::test]
async fn equal_priority_starts_in_arrival_order() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, mut started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("blocker", 9)).await.unwrap();
    next_started(&mut started).await;
    for id in ["first", "second", "third"] {
        scheduler.schedule(job(id, 2)).await.unwrap();
    }

    ev.open();
    wait_events(&mut events, 4, is_finished).await;
    assert_eq!(ev.strategies(), vec!["blocker", "first", "second", "third"]);
}

#[tokio::test]
async fn late_high_priority_does_not_preempt() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, mut started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("low", 0)).await.unwrap();
    next_started(&mut started).await;
    scheduler.schedule(job("urgent", 100)).await.unwrap();

    assert_eq!(
        scheduler.get_job_status("low").unwrap().status,
        JobState::Running
    );
    assert_eq!(
        scheduler.get_job_status("urgent").unwrap().status,
        JobState::Queued
    );

    ev.open();
    wait_events(&mut events, 2, is_finished).await;
    assert_eq!(ev.strategies(), vec!["low", "urgent"]);
}

#[tokio::test]
async fn running_count_never_exceeds_the_cap() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, mut started) = setup(&dir, config(2)).await;
    let mut events = scheduler.subscribe();

    for i in 0..6 {
        let req = JobRequest::optimize(format!("s{}", i), points(3), 10).with_id(format!("j{}", i));
        scheduler.schedule(req).await.unwrap();
        assert!(scheduler.get_status().running_count <= 2);
    }
    next_started(&mut started).await;
    next_started(&mut started).await;
    assert_eq!(scheduler.get_status().running_count, 2);
    assert_eq!(scheduler.get_status().queue_depth, 4);

    for _ in 0..18 {
        ev.release(1);
        tokio::task::yield_now().await;
        assert!(scheduler.get_status().running_count <= 2);
    }
    wait_events(&mut events, 6, is_finished).await;

    assert_eq!(ev.calls().len(), 18);
    assert!(ev.peak() <= 2);
    let status = scheduler.get_status();
    assert_eq!(status.running_count, 0);
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.completed_count, 6);
    assert_eq!(status.max_concurrent, 2);
}

#[tokio::test]
async fn stopping_a_queued_job_never_calls_the_evaluator() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, mut started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("blocker", 0)).await.unwrap();
    next_started(&mut started).await;
    scheduler.schedule(job("victim", 0)).await.unwrap();

    assert!(scheduler.stop_job("victim").await.unwrap());
    assert!(!scheduler.stop_job("victim").await.unwrap());

    ev.open();
    let seen = wait_events(&mut events, 1, is_finished).await;
    assert!(seen.iter().any(
        |e| matches!(e, OptimizerEvent::JobStopped { job_id } if job_id == "victim")
    ));
    scheduler.shutdown().await;

    assert_eq!(ev.calls_for("victim"), 0);
    let store = scheduler.store();
    assert_eq!(
        store.get("victim").await.unwrap().unwrap().state,
        JobState::Canceled
    );
    assert_eq!(
        scheduler.get_job_status("victim").unwrap().status,
        JobState::Canceled
    );
}

#[tokio::test]
async fn stopping_a_running_job_lets_the_inflight_call_finish() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, mut started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    let req = JobRequest::optimize("long", points(4), 10).with_id("long");
    scheduler.schedule(req).await.unwrap();
    next_started(&mut started).await;

    assert!(scheduler.stop_job("long").await.unwrap());
    assert_eq!(scheduler.get_status().running_count, 0);
    ev.open();
    scheduler.shutdown().await;

    assert_eq!(ev.calls_for("long"), 1);
    let record = scheduler.store().get("long").await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Canceled);
    assert!(record.output.is_none());

    let mut stopped = 0;
    while let Ok(e) = events.try_recv() {
        assert!(!matches!(e, OptimizerEvent::JobCompleted { .. }));
        if matches!(e, OptimizerEvent::JobStopped { .. }) {
            stopped += 1;
        }
    }
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn a_failing_job_does_not_stall_the_queue() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, _started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("fail-1", 5)).await.unwrap();
    scheduler.schedule(job("ok-1", 1)).await.unwrap();
    ev.open();

    let seen = wait_events(&mut events, 2, is_finished).await;
    let error_at = seen
        .iter()
        .position(|e| matches!(e, OptimizerEvent::JobError { job_id, .. } if job_id == "fail-1"))
        .expect("error event");
    let done_at = seen
        .iter()
        .position(|e| matches!(e, OptimizerEvent::JobCompleted { job_id, .. } if job_id == "ok-1"))
        .expect("completed event");
    assert!(error_at < done_at);

    let store = scheduler.store();
    let failed = wait_for_state(store, "fail-1", JobState::Error).await;
    let err = failed.error.unwrap();
    assert!(err.message.contains("trial 0"));
    assert!(err.stack.contains("engine crashed"));
    wait_for_state(store, "ok-1", JobState::Done).await;
}

#[tokio::test]
async fn completed_jobs_report_their_best_trial() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, _started) = setup(&dir, config(2)).await;
    let mut events = scheduler.subscribe();

    let req = JobRequest::optimize("grid", points(5), 10).with_id("grid");
    scheduler.schedule(req).await.unwrap();
    ev.open();
    let seen = wait_events(&mut events, 1, is_finished).await;

    let evaluations = seen
        .iter()
        .filter(|e| matches!(e, OptimizerEvent::Evaluation { .. }))
        .count();
    assert_eq!(evaluations, 5);

    let view = scheduler.get_job_status("grid").unwrap();
    assert_eq!(view.status, JobState::Done);
    let result = view.result.unwrap();
    assert_eq!(result.trials_run, 5);
    assert_eq!(result.best.params["x"], json!(4));

    let stored = wait_for_state(scheduler.store(), "grid", JobState::Done).await;
    assert_eq!(stored.output.unwrap().best, result.best);
}

#[tokio::test]
async fn invalid_jobs_never_reach_the_queue() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _ev, _started) = setup(&dir, config(1)).await;

    let zero = JobRequest::optimize("s", one_point(), 0).with_id("zero");
    assert!(matches!(
        scheduler.schedule(zero).await,
        Err(SchedulerError::Validation(ValidationError::ZeroBudget))
    ));
    let empty = JobRequest::optimize("s", ParamSpace::grid(Vec::<(String, _)>::new()), 5)
        .with_id("empty");
    assert!(matches!(
        scheduler.schedule(empty).await,
        Err(SchedulerError::Validation(ValidationError::EmptySpace))
    ));

    assert!(scheduler.get_job("zero").await.unwrap().is_none());
    assert!(scheduler.get_job_status("zero").is_none());
    assert_eq!(scheduler.get_status().queue_depth, 0);
}

#[tokio::test]
async fn full_queue_and_duplicate_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let cfg = SchedulerConfig {
        max_concurrent: 1,
        max_queue_depth: 1,
        ..Default::default()
    };
    let (scheduler, ev, mut started) = setup(&dir, cfg).await;

    scheduler.schedule(job("running", 0)).await.unwrap();
    next_started(&mut started).await;
    scheduler.schedule(job("waiting", 0)).await.unwrap();

    assert!(matches!(
        scheduler.schedule(job("overflow", 0)).await,
        Err(SchedulerError::QueueFull { depth: 1 })
    ));
    assert!(matches!(
        scheduler.schedule(job("running", 0)).await,
        Err(SchedulerError::Duplicate(_))
    ));

    ev.open();
    scheduler.shutdown().await;
    assert!(matches!(
        scheduler.schedule(job("late", 0)).await,
        Err(SchedulerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn unknown_job_has_no_status() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _ev, _started) = setup(&dir, config(1)).await;
    assert!(scheduler.get_job_status("ghost").is_none());
    assert!(!scheduler.stop_job("ghost").await.unwrap());
}

#[tokio::test]
async fn shutdown_leaves_interrupted_jobs_for_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let (scheduler, ev, mut started) = setup(&dir, config(1)).await;
        let req = JobRequest::optimize("long", points(10), 10).with_id("long");
        scheduler.schedule(req).await.unwrap();
        scheduler.schedule(job("waiting", 0)).await.unwrap();
        next_started(&mut started).await;

        let stopping = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.shutdown().await }
        });
        while scheduler.is_accepting() {
            tokio::task::yield_now().await;
        }
        ev.open();
        stopping.await.unwrap();

        let store = scheduler.store();
        assert_eq!(
            store.get("long").await.unwrap().unwrap().state,
            JobState::Running
        );
        assert_eq!(
            store.get("waiting").await.unwrap().unwrap().state,
            JobState::Queued
        );
        assert_eq!(ev.calls_for("long"), 1);
    }

    // restart
    let (scheduler, ev, _started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();
    let store = scheduler.store().clone();
    let candidates: Vec<String> = store
        .resume_candidates()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(candidates, vec!["long"]);

    ev.open();
    let report = scheduler.recover(ResumePolicy::Reschedule).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.rescheduled.len(), 1);

    let interrupted = store.get("long").await.unwrap().unwrap();
    assert_eq!(interrupted.state, JobState::Error);
    assert_eq!(interrupted.error.unwrap().message, "interrupted by restart");

    wait_events(&mut events, 2, is_finished).await;
    wait_for_state(&store, "waiting", JobState::Done).await;
    let copy = wait_for_state(&store, &report.rescheduled[0], JobState::Done).await;
    assert_eq!(copy.strategy_ref, "long");
    assert_eq!(copy.output.unwrap().trials_run, 10);
}

#[tokio::test]
async fn fail_policy_marks_interrupted_jobs_without_rerunning() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir).await;
        let mut r = job("stuck", 0).into_record(stratopt::optimize::model::now_ms());
        r.state = JobState::Running;
        store.put(r).await.unwrap();
    }

    let (scheduler, ev, _started) = setup(&dir, config(1)).await;
    let report = scheduler.recover(ResumePolicy::Fail).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.rescheduled.is_empty());
    assert_eq!(
        scheduler.store().get("stuck").await.unwrap().unwrap().state,
        JobState::Error
    );
    assert!(scheduler.store().resume_candidates().await.unwrap().is_empty());
    assert!(ev.calls().is_empty());
}

#[tokio::test]
async fn cleanup_forgets_expired_jobs() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, _started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("old", 0)).await.unwrap();
    ev.open();
    wait_events(&mut events, 1, is_finished).await;
    wait_for_state(scheduler.store(), "old", JobState::Done).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    assert_eq!(scheduler.cleanup(0).await.unwrap(), 1);
    assert!(scheduler.get_job("old").await.unwrap().is_none());
    assert!(scheduler.get_job_status("old").is_none());
    assert_eq!(scheduler.get_status().completed_count, 0);
}

#[tokio::test]
async fn cleanup_with_an_enormous_age_keeps_fresh_jobs() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, _started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("fresh", 0)).await.unwrap();
    ev.open();
    wait_events(&mut events, 1, is_finished).await;
    wait_for_state(scheduler.store(), "fresh", JobState::Done).await;

    let cmd: AppCommand = "cleanup 18446744073709551615".parse().unwrap();
    assert_eq!(
        cmd,
        AppCommand::Cleanup {
            max_age_secs: Some(u64::MAX)
        }
    );
    let reply = dispatch(cmd, &scheduler, Duration::from_secs(60)).await;
    assert_eq!(reply.lines, vec!["✓ removed 0 jobs".to_string()]);
    assert!(scheduler.get_job("fresh").await.unwrap().is_some());
}

#[tokio::test]
async fn a_submission_whose_write_failed_can_be_retried() {
    let dir = TempDir::new().unwrap();
    let (scheduler, ev, _started) = setup(&dir, config(1)).await;
    let mut events = scheduler.subscribe();
    let db = scheduler.store().db().clone();

    db.execute_unprepared(
        "CREATE TRIGGER reject_jobs BEFORE INSERT ON optimization_jobs \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .await
    .unwrap();
    assert!(matches!(
        scheduler.schedule(job("j1", 0)).await,
        Err(SchedulerError::Store(_))
    ));
    assert!(scheduler.get_job("j1").await.unwrap().is_none());
    assert!(scheduler.get_job_status("j1").is_none());
    assert!(scheduler.list_jobs().await.unwrap().is_empty());

    db.execute_unprepared("DROP TRIGGER reject_jobs").await.unwrap();
    ev.open();
    scheduler.schedule(job("j1", 0)).await.unwrap();
    wait_events(&mut events, 1, is_finished).await;
    wait_for_state(scheduler.store(), "j1", JobState::Done).await;
}

#[tokio::test]
async fn jobs_waiting_past_the_limit_are_canceled_unstarted() {
    let dir = TempDir::new().unwrap();
    let cfg = SchedulerConfig {
        queue_wait_limit: Some(Duration::from_millis(50)),
        ..config(1)
    };
    let (scheduler, ev, mut started) = setup(&dir, cfg).await;
    let mut events = scheduler.subscribe();

    scheduler.schedule(job("blocker", 0)).await.unwrap();
    next_started(&mut started).await;
    scheduler.schedule(job("stale", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    ev.open();
    wait_events(&mut events, 1, |e| {
        matches!(e, OptimizerEvent::JobStopped { job_id } if job_id == "stale")
    })
    .await;
    wait_for_state(scheduler.store(), "stale", JobState::Canceled).await;
    assert_eq!(ev.calls_for("stale"), 0);
    assert_eq!(
        scheduler.get_job_status("stale").unwrap().status,
        JobState::Canceled
    );

    // a job that finds a free slot starts right away
    scheduler.schedule(job("fresh", 0)).await.unwrap();
    wait_for_state(scheduler.store(), "fresh", JobState::Done).await;
    assert_eq!(ev.calls_for("fresh"), 1);
}
