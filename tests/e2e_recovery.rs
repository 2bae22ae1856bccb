//! Crash recovery, competing runtimes, poison messages and startup checks.

use durasql::providers::sqlite::SqliteProvider;
use durasql::providers::Provider;
use durasql::{
    ActivityContext, ActivityRegistry, Client, EventKind, FailureDetails, OrchestrationContext,
    OrchestrationRegistry, OrchestrationStatus, Runtime, RuntimeError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;

fn waiter_registry() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Waiter", |ctx: OrchestrationContext, input: String| async move {
            let data = ctx.wait_for_external_event("Resume").await;
            Ok(format!("{input}+{data}"))
        })
        .build()
}

#[tokio::test]
async fn new_runtime_resumes_work_of_a_stopped_one() {
    let (store, _td, url) = common::create_sqlite_store_disk_with(None).await;
    let rt1 = Runtime::start(
        store.clone(),
        ActivityRegistry::builder().build(),
        waiter_registry(),
        common::fast_options(),
    )
    .await
    .unwrap();
    let client = rt1.client();
    client.create_instance("inst-resume", "Waiter", "start").await.unwrap();
    assert!(common::wait_for_history(store.clone(), "inst-resume", |h| h.len() >= 2, 5_000).await);
    rt1.shutdown().await;
    drop(store);

    // A second process opens the same database.
    let store2: Arc<dyn Provider> = Arc::new(SqliteProvider::new(&url, None).await.unwrap());
    let rt2 = Runtime::start(
        store2.clone(),
        ActivityRegistry::builder().build(),
        waiter_registry(),
        common::fast_options(),
    )
    .await
    .unwrap();
    let client2 = Client::new(store2.clone());
    client2.raise_event("inst-resume", "Resume", "later").await.unwrap();
    let info = client2
        .wait_for_completion("inst-resume", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.output.as_deref(), Some("start+later"));

    rt2.shutdown().await;
}

#[tokio::test]
async fn expired_lease_of_a_crashed_worker_is_reclaimed() {
    let (store, _td) = common::create_sqlite_store_disk().await;
    let client = Client::new(store.clone());
    client.create_instance("inst-crash", "Echo", "survived").await.unwrap();

    // A worker takes the batch and dies without acking or abandoning.
    let (item, _token, _) = store
        .fetch_orchestration_item(Duration::from_millis(500), 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.instance, "inst-crash");
    assert!(store
        .fetch_orchestration_item(Duration::from_secs(5), 10)
        .await
        .unwrap()
        .is_none());

    let orchestrations = OrchestrationRegistry::builder()
        .register("Echo", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt = Runtime::start(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        common::fast_options(),
    )
    .await
    .unwrap();
    let info = client
        .wait_for_completion("inst-crash", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(info.output.as_deref(), Some("survived"));

    rt.shutdown().await;
}

#[tokio::test]
async fn competing_runtimes_commit_each_turn_once() {
    let (store, _td, url) = common::create_sqlite_store_disk_with(None).await;
    let store2: Arc<dyn Provider> = Arc::new(SqliteProvider::new(&url, None).await.unwrap());

    let executions = Arc::new(AtomicUsize::new(0));
    let make_activities = |counter: Arc<AtomicUsize>| {
        ActivityRegistry::builder()
            .register("Step", move |_ctx: ActivityContext, input: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("{input}."))
                }
            })
            .build()
    };
    let make_orchestrations = || {
        OrchestrationRegistry::builder()
            .register("ThreeSteps", |ctx: OrchestrationContext, input: String| async move {
                let a = ctx.schedule_activity("Step", input).await?;
                let b = ctx.schedule_activity("Step", a).await?;
                ctx.schedule_activity("Step", b).await
            })
            .build()
    };

    let options = common::fast_options()
        .with_orchestration_concurrency(3)
        .with_worker_concurrency(3);
    let rt1 = Runtime::start(
        store.clone(),
        make_activities(executions.clone()),
        make_orchestrations(),
        options.clone(),
    )
    .await
    .unwrap();
    let rt2 = Runtime::start(
        store2.clone(),
        make_activities(executions.clone()),
        make_orchestrations(),
        options,
    )
    .await
    .unwrap();

    let client = Client::new(store.clone());
    let ids: Vec<String> = (0..12).map(|i| format!("inst-race-{i}")).collect();
    for id in &ids {
        client.create_instance(id, "ThreeSteps", "x").await.unwrap();
    }
    for id in &ids {
        let info = client.wait_for_completion(id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(info.status, OrchestrationStatus::Completed, "{id}");
        assert_eq!(info.output.as_deref(), Some("x..."), "{id}");

        let history = client.read_history(id, None).await.unwrap();
        common::assert_contiguous(&history);
        let scheduled = history
            .iter()
            .filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
            .count();
        assert_eq!(scheduled, 3, "{id}: {history:?}");
        let closed = history.iter().filter(|e| e.kind.is_terminal()).count();
        assert_eq!(closed, 1, "{id}");
    }
    // Activities are at-least-once; nothing here forces a redelivery.
    assert!(executions.load(Ordering::SeqCst) >= ids.len() * 3);

    rt1.shutdown().await;
    rt2.shutdown().await;
}

#[tokio::test]
async fn poison_batch_fails_the_instance() {
    let store = common::create_sqlite_store_memory().await;
    let client = Client::new(store.clone());
    client.create_instance("inst-poison", "Echo", "x").await.unwrap();

    for _ in 0..3 {
        let (_, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 10)
            .await
            .unwrap()
            .unwrap();
        store.abandon_orchestration_item(&token, None).await.unwrap();
    }

    let orchestrations = OrchestrationRegistry::builder()
        .register("Echo", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt = Runtime::start(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        common::fast_options().with_max_attempts(2),
    )
    .await
    .unwrap();

    let info = client
        .wait_for_completion("inst-poison", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Failed);
    assert_eq!(info.failure().unwrap().error_type, FailureDetails::POISON);

    rt.shutdown().await;
}

#[tokio::test]
async fn shutdown_timeout_aborts_running_activities() {
    let store = common::create_sqlite_store_memory().await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_flag, finished_flag) = (started.clone(), finished.clone());
    let activities = ActivityRegistry::builder()
        .register("Slow", move |_ctx: ActivityContext, _input: String| {
            let (started, finished) = (started_flag.clone(), finished_flag.clone());
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(800)).await;
                finished.store(true, Ordering::SeqCst);
                Ok("done".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsSlow", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Slow", "").await
        })
        .build();
    let rt = Runtime::start(
        store.clone(),
        activities,
        orchestrations,
        common::fast_options().with_shutdown_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let client = rt.client();
    client.create_instance("inst-slow", "CallsSlow", "").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !started.load(Ordering::SeqCst) {
        assert!(tokio::time::Instant::now() < deadline, "activity never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    rt.shutdown().await;

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(!finished.load(Ordering::SeqCst));
    let info = client.get_status("inst-slow").await.unwrap().unwrap();
    assert_eq!(info.status, OrchestrationStatus::Running);
}

#[tokio::test]
async fn poison_activity_is_failed_without_running() {
    let store = common::create_sqlite_store_memory().await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let activities = ActivityRegistry::builder()
        .register("Work", move |_ctx: ActivityContext, _input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("done".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Caller", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Work", "").await
        })
        .build();

    // First runtime only runs orchestrations, so the activity stays queued.
    let client = Client::new(store.clone());
    client.create_instance("inst-poison-act", "Caller", "").await.unwrap();
    let rt = Runtime::start(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations.clone(),
        common::fast_options().with_worker_concurrency(0),
    )
    .await
    .unwrap();
    assert!(common::wait_for_activity_scheduled(store.clone(), "inst-poison-act", "Work", 5_000).await);
    rt.shutdown().await;

    for _ in 0..3 {
        if let Some((_, token, _)) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap() {
            store.abandon_work_item(&token, None).await.unwrap();
        }
    }

    let rt = Runtime::start(
        store.clone(),
        activities,
        orchestrations,
        common::fast_options().with_max_attempts(2),
    )
    .await
    .unwrap();
    let info = client
        .wait_for_completion("inst-poison-act", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Failed);
    assert!(info.output.unwrap_or_default().contains("max 2"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    rt.shutdown().await;
}

#[tokio::test]
async fn schema_version_mismatch_prevents_start() {
    let provider = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
    sqlx::query("UPDATE schema_version SET version = version + 1")
        .execute(provider.get_pool())
        .await
        .unwrap();

    let result = Runtime::start(
        provider.clone(),
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
        common::fast_options(),
    )
    .await;
    assert!(matches!(result, Err(RuntimeError::Schema(_))));
}
