//! Durability, checkpointing, and crash-recovery behavior

mod common;

use common::*;
use std::time::Duration;
use taskfabric::{TaskEngine, TaskFilter, TaskSpec, TaskStatus};

const WAIT: Duration = Duration::from_secs(10);

fn spec(title: &str, routine: std::sync::Arc<dyn taskfabric::TaskRoutine>) -> TaskSpec {
    TaskSpec::builder(title, "persistence fixture", routine)
        .build()
        .unwrap()
}

/// Parse a persisted record envelope and return its payload
fn read_payload(path: &std::path::Path) -> serde_json::Value {
    let text = std::fs::read_to_string(path).unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&text).unwrap();
    envelope["payload"].clone()
}

#[tokio::test]
async fn tasks_survive_on_disk_with_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::new(disk_config(dir.path())).await.unwrap();

    let id = engine.submit(spec("durable", ok_routine(10))).await.unwrap();
    assert_eq!(
        wait_terminal(&engine, id, WAIT).await,
        Some(TaskStatus::Completed)
    );

    let record = dir.path().join("tasks").join(format!("{id}.json"));
    assert!(record.exists());
    let payload = read_payload(&record);
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["title"], "durable");

    engine.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn advisory_lock_follows_engine_lifetime() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::new(disk_config(dir.path())).await.unwrap();
    assert!(dir.path().join(".lock").exists());

    engine.shutdown(None).await.unwrap();
    assert!(!dir.path().join(".lock").exists());

    // the session record is terminated with an end time
    let sessions: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(sessions.len(), 1);
    let payload = read_payload(&sessions[0]);
    assert_eq!(payload["state"], "terminated");
    assert!(!payload["end_time"].is_null());
}

#[tokio::test]
async fn manual_checkpoint_and_restore_drop_later_work() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::new(disk_config(dir.path())).await.unwrap();
    engine.pause().await;

    let t1 = engine.submit(spec("first", ok_routine(5))).await.unwrap();
    let t2 = engine.submit(spec("second", ok_routine(5))).await.unwrap();
    let checkpoint = engine.checkpoint().await.unwrap().expect("persistence on");

    let t3 = engine.submit(spec("third", ok_routine(5))).await.unwrap();
    assert!(engine.get_task(t3).await.is_some());

    engine.restore_checkpoint(checkpoint.id).await.unwrap();
    assert!(engine.get_task(t1).await.is_some());
    assert!(engine.get_task(t2).await.is_some());
    assert!(
        engine.get_task(t3).await.is_none(),
        "work submitted after the checkpoint must be gone after restore"
    );

    engine.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn crash_recovery_requeues_running_work_at_least_once() {
    let dir = tempfile::tempdir().unwrap();

    // Session one: ten tasks, three of them mid-flight, then the process
    // "dies" (engine dropped without shutdown; heartbeats stop).
    let mut ids = Vec::new();
    {
        let mut config = disk_config(dir.path());
        config.max_concurrent_tasks = 3;
        let engine = TaskEngine::new(config).await.unwrap();
        for i in 0..10 {
            let id = engine
                .submit(spec(&format!("work-{i}"), hanging_routine()))
                .await
                .unwrap();
            ids.push(id);
        }

        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let running = engine
                .list_tasks(Some(TaskFilter {
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                }))
                .await;
            if running.len() == 3 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "three tasks never reached running"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.checkpoint().await.unwrap();
        // no shutdown: the session record stays active with a stale
        // heartbeat, exactly like a crash
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Session two: treat any silent session as crashed immediately.
    let mut config = disk_config(dir.path());
    config.max_concurrent_tasks = 3;
    config.persistence.session_timeout_secs = 0;
    let engine = TaskEngine::new(config).await.unwrap();

    let restored = engine.list_tasks(None).await;
    assert_eq!(restored.len(), 10, "all tasks restored");
    let recovered: Vec<_> = restored
        .iter()
        .filter(|t| t.current_retries >= 1)
        .collect();
    assert_eq!(recovered.len(), 3, "the three running tasks retry");
    for task in &recovered {
        assert!(matches!(
            task.status,
            TaskStatus::PendingRetry | TaskStatus::Queued
        ));
        assert!(!task.retry_history.is_empty());
    }

    // Routines are runtime handles; re-register fast ones and drain.
    for id in &ids {
        assert!(engine.register_routine(*id, ok_routine(5)).await);
    }
    for id in &ids {
        assert_eq!(
            wait_terminal(&engine, *id, WAIT).await,
            Some(TaskStatus::Completed),
            "task {id} did not complete after recovery"
        );
    }
    let after: Vec<_> = engine
        .list_tasks(None)
        .await
        .into_iter()
        .filter(|t| t.current_retries >= 1)
        .collect();
    assert_eq!(after.len(), 3, "retry counts make at-least-once observable");

    engine.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn recovered_tasks_wait_for_their_routines() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let engine = TaskEngine::new(disk_config(dir.path())).await.unwrap();
        let id = engine.submit(spec("orphan", hanging_routine())).await.unwrap();
        assert!(wait_for_status(&engine, id, TaskStatus::Running, WAIT).await);
        engine.checkpoint().await.unwrap();
        id
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut config = disk_config(dir.path());
    config.persistence.session_timeout_secs = 0;
    let engine = TaskEngine::new(config).await.unwrap();

    // without a routine the task must not dispatch, and must not fail
    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = engine.get_task(id).await.unwrap();
    assert!(
        matches!(task.status, TaskStatus::PendingRetry | TaskStatus::Queued),
        "got {:?}",
        task.status
    );

    assert!(engine.register_routine(id, ok_routine(5)).await);
    assert_eq!(
        wait_terminal(&engine, id, WAIT).await,
        Some(TaskStatus::Completed)
    );
    engine.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn shutdown_cancels_stragglers_and_records_it() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::new(disk_config(dir.path())).await.unwrap();

    let id = engine
        .submit(spec("straggler", hanging_routine()))
        .await
        .unwrap();
    assert!(wait_for_status(&engine, id, TaskStatus::Running, WAIT).await);

    engine
        .shutdown(Some(Duration::from_millis(100)))
        .await
        .unwrap();

    let task = engine.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(
        task.metadata.contains_key("leaked_work")
            || task.metadata.contains_key("shutdown_abandoned"),
        "abandonment must be recorded: {:?}",
        task.metadata
    );
}

#[tokio::test]
async fn cleanup_prunes_old_terminal_tasks_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::new(disk_config(dir.path())).await.unwrap();

    let id = engine.submit(spec("ephemeral", ok_routine(5))).await.unwrap();
    assert_eq!(
        wait_terminal(&engine, id, WAIT).await,
        Some(TaskStatus::Completed)
    );

    // nothing is old enough yet
    let removed = engine.cleanup(chrono::Duration::days(1)).await.unwrap();
    assert!(removed.is_empty());

    // everything terminal is older than "zero seconds ago"
    let removed = engine.cleanup(chrono::Duration::zero()).await.unwrap();
    assert_eq!(removed, vec![id]);
    assert!(engine.get_task(id).await.is_none());
    assert!(!dir
        .path()
        .join("tasks")
        .join(format!("{id}.json"))
        .exists());

    engine.shutdown(None).await.unwrap();
}
