//! Instance lifecycle: sub-orchestrations, termination, unknown handlers,
//! re-creation and purge.

use durasql::{
    ActivityContext, ActivityRegistry, ClientError, EventKind, FailureDetails, OrchestrationContext,
    OrchestrationRegistry, OrchestrationStatus, PurgeFilter, Runtime,
};
use std::time::Duration;

mod common;

fn no_activities() -> ActivityRegistry {
    ActivityRegistry::builder().build()
}

#[tokio::test]
async fn sub_orchestration_result_flows_to_parent() {
    let store = common::create_sqlite_store_memory().await;
    let activities = ActivityRegistry::builder()
        .register("Upper", |_ctx: ActivityContext, input: String| async move { Ok(input.to_uppercase()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Upper", input).await
        })
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            let child = format!("{}::child", ctx.instance_id());
            let result = ctx.schedule_sub_orchestration("Child", child, input).await?;
            Ok(format!("parent got {result}"))
        })
        .build();
    let rt = Runtime::start(store.clone(), activities, orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    client.create_instance("inst-parent", "Parent", "hi").await.unwrap();
    let info = client
        .wait_for_completion("inst-parent", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(info.output.as_deref(), Some("parent got HI"));

    let child = client.get_status("inst-parent::child").await.unwrap().unwrap();
    assert_eq!(child.status, OrchestrationStatus::Completed);
    assert_eq!(child.parent_instance.as_deref(), Some("inst-parent"));

    rt.shutdown().await;
}

#[tokio::test]
async fn failed_child_surfaces_as_error_in_parent() {
    let store = common::create_sqlite_store_memory().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("BadChild", |_ctx: OrchestrationContext, _input: String| async move {
            Err::<String, String>("child broke".to_string())
        })
        .register("Parent", |ctx: OrchestrationContext, _input: String| async move {
            match ctx
                .schedule_sub_orchestration("BadChild", "inst-p2::child", "")
                .await
            {
                Ok(v) => Ok(format!("unexpected {v}")),
                Err(e) => Ok(format!("caught: {e}")),
            }
        })
        .build();
    let rt = Runtime::start(store.clone(), no_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    client.create_instance("inst-p2", "Parent", "").await.unwrap();
    let info = client
        .wait_for_completion("inst-p2", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Completed);
    let output = info.output.unwrap_or_default();
    assert!(output.starts_with("caught: "), "{output}");
    assert!(output.contains("child broke"), "{output}");

    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_stops_a_waiting_instance() {
    let store = common::create_sqlite_store_memory().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("Forever", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.wait_for_external_event("Never").await)
        })
        .build();
    let rt = Runtime::start(store.clone(), no_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    client.create_instance("inst-term", "Forever", "").await.unwrap();
    assert!(common::wait_for_history(store.clone(), "inst-term", |h| h.len() >= 2, 5_000).await);

    client.terminate_instance("inst-term", "operator request").await.unwrap();
    let info = client
        .wait_for_completion("inst-term", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Terminated);
    assert_eq!(info.output.as_deref(), Some("operator request"));

    let history = client.read_history("inst-term", None).await.unwrap();
    assert!(matches!(
        history.last().map(|e| &e.kind),
        Some(EventKind::ExecutionTerminated { reason }) if reason == "operator request"
    ));

    // Terminating a finished instance is a no-op; an unknown one is an error.
    client.terminate_instance("inst-term", "again").await.unwrap();
    assert!(matches!(
        client.terminate_instance("missing", "x").await,
        Err(ClientError::NotFound(id)) if id == "missing"
    ));

    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_without_retrying() {
    let store = common::create_sqlite_store_memory().await;
    let rt = Runtime::start(
        store.clone(),
        no_activities(),
        OrchestrationRegistry::builder().build(),
        common::fast_options(),
    )
    .await
    .unwrap();
    let client = rt.client();

    client.create_instance("inst-ghost", "Ghost", "").await.unwrap();
    let info = client
        .wait_for_completion("inst-ghost", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Failed);
    assert_eq!(info.failure().unwrap().error_type, FailureDetails::UNREGISTERED);

    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_the_call() {
    let store = common::create_sqlite_store_memory().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsGhost", |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity("Ghost", "").await {
                Ok(_) => Ok("ran".to_string()),
                Err(e) => Ok(format!("activity failed: {e}")),
            }
        })
        .build();
    let rt = Runtime::start(store.clone(), no_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    client.create_instance("inst-ghost-act", "CallsGhost", "").await.unwrap();
    let info = client
        .wait_for_completion("inst-ghost-act", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Completed);
    assert!(info.output.unwrap_or_default().contains("not registered"));

    let history = client.read_history("inst-ghost-act", None).await.unwrap();
    let failed = history.iter().find_map(|e| match &e.kind {
        EventKind::TaskFailed { details } => Some(details.clone()),
        _ => None,
    });
    assert_eq!(failed.unwrap().error_type, FailureDetails::UNREGISTERED);

    rt.shutdown().await;
}

#[tokio::test]
async fn panicking_activity_is_reported_as_failure() {
    let store = common::create_sqlite_store_memory().await;
    let activities = ActivityRegistry::builder()
        .register("Explode", |_ctx: ActivityContext, _input: String| async move {
            if true {
                panic!("activity exploded");
            }
            Ok(String::new())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Caller", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Explode", "").await
        })
        .build();
    let rt = Runtime::start(store.clone(), activities, orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    client.create_instance("inst-panic", "Caller", "").await.unwrap();
    let info = client
        .wait_for_completion("inst-panic", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, OrchestrationStatus::Failed);
    assert!(info.output.unwrap_or_default().contains("activity exploded"));

    rt.shutdown().await;
}

#[tokio::test]
async fn running_instance_cannot_be_created_twice_but_finished_one_restarts() {
    let store = common::create_sqlite_store_memory().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("Gate", |ctx: OrchestrationContext, input: String| async move {
            let go = ctx.wait_for_external_event("Go").await;
            Ok(format!("{input}:{go}"))
        })
        .build();
    let rt = Runtime::start(store.clone(), no_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    assert_eq!(client.create_instance("inst-gate", "Gate", "a").await.unwrap(), 1);
    assert!(matches!(
        client.create_instance("inst-gate", "Gate", "b").await,
        Err(ClientError::InstanceExists(_))
    ));

    client.raise_event("inst-gate", "Go", "1").await.unwrap();
    let info = client
        .wait_for_completion("inst-gate", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.output.as_deref(), Some("a:1"));

    assert_eq!(client.create_instance("inst-gate", "Gate", "c").await.unwrap(), 2);
    client.raise_event("inst-gate", "Go", "2").await.unwrap();
    let info = client
        .wait_for_completion("inst-gate", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.execution_id, 2);
    assert_eq!(info.output.as_deref(), Some("c:2"));

    let first = client.read_history("inst-gate", Some(1)).await.unwrap();
    assert!(matches!(
        first.last().map(|e| &e.kind),
        Some(EventKind::ExecutionCompleted { result, .. }) if result == "a:1"
    ));

    rt.shutdown().await;
}

#[tokio::test]
async fn purge_removes_finished_instances_only() {
    let store = common::create_sqlite_store_memory().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .register("Slow", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.wait_for_external_event("Done").await)
        })
        .build();
    let rt = Runtime::start(store.clone(), no_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();

    for i in 0..3 {
        let id = format!("inst-quick-{i}");
        client.create_instance(&id, "Quick", "x").await.unwrap();
        client.wait_for_completion(&id, Duration::from_secs(5)).await.unwrap();
    }
    client.create_instance("inst-slow", "Slow", "").await.unwrap();
    assert!(common::wait_for_history(store.clone(), "inst-slow", |h| h.len() >= 2, 5_000).await);

    let single = client.purge_instance("inst-quick-0").await.unwrap();
    assert_eq!(single.instances_deleted, 1);
    assert!(single.events_deleted > 0);
    assert!(client.get_status("inst-quick-0").await.unwrap().is_none());

    let untouched = client.purge_instance("inst-slow").await.unwrap();
    assert_eq!(untouched.instances_deleted, 0);

    let swept = client
        .purge_instances(PurgeFilter {
            statuses: vec![OrchestrationStatus::Completed, OrchestrationStatus::Running],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(swept.instances_deleted, 2);
    assert!(client.get_status("inst-slow").await.unwrap().is_some());

    rt.shutdown().await;
}
