// ABOUTME: Tests for the JSON command surface.
// ABOUTME: Drives the service through Command values and raw JSON text.

use serde_json::{Value, json};

use super::api::{Command, Response, internal_error};
use super::service::ConcurrencyService;
use crate::config::ManagerConfig;
use crate::deadlock::ResolutionStrategy;
use crate::lock::{AcquireRequest, Acquisition, LockId};

fn service() -> ConcurrencyService {
    ConcurrencyService::new(ManagerConfig::default()).unwrap()
}

async fn call(service: &ConcurrencyService, command: Value) -> Value {
    let text = service.handle_json(&command.to_string()).await;
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_acquire_and_release_over_json() {
    let service = service();

    let granted = call(
        &service,
        json!({"op": "acquire", "agent": "Dev", "resource": "DeployPipeline", "priority": 5}),
    )
    .await;
    assert_eq!(granted["type"], "granted");
    assert_eq!(granted["data"]["resource"], "DeployPipeline");
    let lock_id = granted["data"]["lock_id"].as_str().unwrap().to_string();

    let locks = call(&service, json!({"op": "active_locks"})).await;
    assert_eq!(locks["type"], "active_locks");
    assert_eq!(locks["data"][0]["holder"], "Dev");
    assert_eq!(locks["data"][0]["stage"], "acquired");

    let released = call(&service, json!({"op": "release", "lock_id": lock_id})).await;
    assert_eq!(released, json!({"type": "ok"}));

    let history = call(&service, json!({"op": "history", "limit": 1})).await;
    assert_eq!(history["data"][0]["event_type"], "released");
}

#[tokio::test]
async fn test_override_missing_lock_reports_not_found() {
    let service = service();
    let response = service
        .handle(Command::Override {
            lock_id: LockId::new(),
            reason: "cleanup".to_string(),
        })
        .await;
    match response {
        Response::Error { code, .. } => assert_eq!(code, "not_found"),
        other => panic!("Expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_priority_reports_invalid_request() {
    let service = service();
    let response = call(
        &service,
        json!({"op": "acquire", "agent": "Dev", "resource": "X", "priority": 42}),
    )
    .await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["data"]["code"], "invalid_request");
}

#[tokio::test]
async fn test_unrepresentable_lease_reports_invalid_request() {
    let service = service();
    let response = call(
        &service,
        json!({"op": "acquire", "agent": "A", "resource": "Y", "lease_ms": 10_000_000_000_000_000u64}),
    )
    .await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["data"]["code"], "invalid_request");
    assert!(service.active_locks().is_empty());
}

#[test]
fn test_internal_error_escapes_message() {
    let text = internal_error(r#"bad "value" \ here"#);
    let response: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(response["type"], "error");
    assert_eq!(response["data"]["code"], "internal");
    assert_eq!(response["data"]["message"], r#"bad "value" \ here"#);
}

#[tokio::test]
async fn test_malformed_json_is_rejected() {
    let service = service();
    let text = service.handle_json("{\"op\": \"launch\"}").await;
    let response: Response = serde_json::from_str(&text).unwrap();
    assert!(response.is_error());
}

#[tokio::test]
async fn test_resolve_requires_two_agents() {
    let service = service();
    let response = service
        .handle(Command::ResolveDeadlock {
            cycle: vec!["A".to_string()],
            strategy: ResolutionStrategy::Oldest,
            victim: None,
        })
        .await;
    assert!(response.is_error());
}

#[tokio::test]
async fn test_resolve_dissolved_cycle_succeeds() {
    let service = service();
    let response = call(
        &service,
        json!({"op": "resolve_deadlock", "cycle": ["A", "B"], "strategy": "random"}),
    )
    .await;
    assert_eq!(response["type"], "resolved");
    assert_eq!(response["data"]["victims"], json!([]));
}

#[tokio::test]
async fn test_queries_return_empty_collections() {
    let service = service();
    assert_eq!(
        call(&service, json!({"op": "conflicts"})).await,
        json!({"type": "conflicts", "data": []})
    );
    assert_eq!(
        call(&service, json!({"op": "patterns", "top_n": 5})).await,
        json!({"type": "patterns", "data": []})
    );
    assert_eq!(
        call(&service, json!({"op": "detect_deadlocks"})).await,
        json!({"type": "deadlocks", "data": []})
    );
    let analytics = call(&service, json!({"op": "analytics"})).await;
    assert_eq!(analytics["data"]["total_locks_acquired"], 0);
}

#[test]
fn test_command_wire_shape() {
    let command: Command =
        serde_json::from_str(r#"{"op":"acquire","agent":"QA","resource":"X"}"#).unwrap();
    assert_eq!(
        command,
        Command::Acquire {
            agent: "QA".to_string(),
            resource: "X".to_string(),
            priority: 5,
            timeout_ms: None,
            retry_count: 0,
            context_id: None,
            lease_ms: None,
        }
    );
}

#[tokio::test]
async fn test_waiting_queue_wire_shape() {
    let service = service();
    service.acquire(AcquireRequest::new("Dev", "X")).await.unwrap();
    let pending = match service.request(AcquireRequest::new("QA", "X").priority(3)).unwrap() {
        Acquisition::Queued(pending) => pending,
        Acquisition::Granted(_) => panic!("resource should be held"),
    };

    let locks = call(&service, json!({"op": "active_locks"})).await;
    let waiter = locks["data"][0]["waiting_queue"][0].as_object().unwrap();
    let mut keys: Vec<&str> = waiter.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["agent", "priority", "request_id", "requested_at", "resource", "retry_count", "timeout_ms"]
    );
    assert_eq!(waiter["request_id"], json!(pending.lock_id().to_string()));
}
