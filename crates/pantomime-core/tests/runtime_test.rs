//! End-to-end tests of the runtime: registry, executor, triggers,
//! workflows, and the tool protocol surface working together.

use std::sync::Arc;

use serde_json::json;

use pantomime_core::config::RuntimeConfig;
use pantomime_core::definition::{ErrorProfile, RateLimitPolicy, RateLimitScope};
use pantomime_core::protocol::SimulatorServer;
use pantomime_core::registry::Registry;
use pantomime_core::test_utils::{crm_app, email_app};
use pantomime_core::types::InstanceId;
use pantomime_core::workflow::{FailurePolicy, StepStatus, WorkflowSpec, WorkflowStep};
use pantomime_tools::{ErrorKind, InvokeError};

fn registry() -> Registry {
    let registry = Registry::in_memory(RuntimeConfig::deterministic());
    registry.install(email_app()).unwrap();
    registry.install(crm_app()).unwrap();
    registry
}

fn step(app: &str, action: &str, input: serde_json::Value) -> WorkflowStep {
    WorkflowStep {
        app: app.to_string(),
        account: "acct-1".to_string(),
        action: action.to_string(),
        input,
        retry_limit: 2,
        idempotency_key: None,
    }
}

#[tokio::test]
async fn failed_invocations_leave_state_untouched() {
    let registry = registry();
    let id = InstanceId::new("pipedream_crm", "acct-1");
    registry
        .invoke(&id, "create_contact", json!({"name": "Ada"}), None)
        .await
        .unwrap();

    // Schema rejection, unknown action, and a missing target all fail
    // without advancing the version.
    for (action, input) in [
        ("create_contact", json!({})),
        ("teleport_contact", json!({"name": "Ada"})),
        ("delete_contact", json!({"id": "nope"})),
    ] {
        registry.invoke(&id, action, input, None).await.unwrap_err();
    }

    let state = registry.state(&id).unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(state.doc["contacts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_idempotency_key_applies_once() {
    let registry = registry();
    let id = InstanceId::new("pipedream_crm", "acct-1");

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(
            registry
                .invoke(&id, "create_contact", json!({"name": "Ada"}), Some("retry-1"))
                .await
                .unwrap(),
        );
    }
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    let state = registry.state(&id).unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(state.doc["contacts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn email_rate_limit_scenario() {
    let mut app = email_app();
    // send_email: burst of two, no refill.
    app.actions[0].rate_limit = Some(RateLimitPolicy {
        capacity: 2,
        refill_per_sec: 0.0,
        scope: RateLimitScope::Action,
    });
    let registry = Registry::in_memory(RuntimeConfig::deterministic());
    registry.install(app).unwrap();

    let id = InstanceId::new("mailbird", "acct-1");
    registry.instance(&id).unwrap().authenticate();

    for n in 0..2 {
        let outcome = registry
            .invoke(&id, "send_email", json!({"to": "a@b.c"}), None)
            .await
            .unwrap();
        assert_eq!(outcome.state_version, n + 1);
    }
    let err = registry
        .invoke(&id, "send_email", json!({"to": "a@b.c"}), None)
        .await
        .unwrap_err();
    match err {
        InvokeError::RateLimitExceeded { retry_after_ms } => {
            assert!(retry_after_ms > 0);
            assert!(err.is_retryable());
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }

    let state = registry.state(&id).unwrap();
    assert_eq!(state.doc["sentMessages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn polling_trigger_scenario() {
    let registry = registry();
    let id = InstanceId::new("mailbird", "acct-1");
    let sub = registry.subscribe(&id, "message_received", None).unwrap();

    for n in 0..3 {
        registry
            .invoke(
                &id,
                "receive_message",
                json!({"from": format!("sender-{n}@x.y")}),
                None,
            )
            .await
            .unwrap();
    }

    let page = registry.dispatcher().poll(sub, 0).unwrap();
    let seqs: Vec<u64> = page.events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(page.next_cursor, 3);
    assert_eq!(page.events[0].payload["trigger"], "message_received");

    // Cursor advances past everything seen; re-polling is empty.
    let empty = registry.dispatcher().poll(sub, page.next_cursor).unwrap();
    assert!(empty.events.is_empty());
    assert_eq!(empty.next_cursor, 3);
}

#[tokio::test]
async fn concurrent_writers_lose_no_updates() {
    let registry = Arc::new(registry());
    let id = InstanceId::new("pipedream_crm", "acct-1");
    registry.instance(&id).unwrap();

    let mut handles = Vec::new();
    for n in 0..10 {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            registry
                .invoke(&id, "create_contact", json!({"name": format!("c-{n}")}), None)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let state = registry.state(&id).unwrap();
    assert_eq!(state.version, 10);
    assert_eq!(state.doc["contacts"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn always_fail_permanent_scenario() {
    let mut app = crm_app();
    app.error_profile = ErrorProfile::AlwaysFailPermanent;
    let registry = Registry::in_memory(RuntimeConfig::default());
    registry.install(app).unwrap();
    let id = InstanceId::new("pipedream_crm", "acct-1");

    for _ in 0..3 {
        let err = registry
            .invoke(&id, "create_contact", json!({"name": "Ada"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::ChaosPermanent { .. }));
        assert!(!err.is_retryable());
    }
    assert_eq!(registry.state(&id).unwrap().version, 0);
}

#[tokio::test]
async fn workflow_spans_apps_and_reports_per_step() {
    let registry = registry();
    registry
        .instance(&InstanceId::new("mailbird", "acct-1"))
        .unwrap()
        .authenticate();

    let spec = WorkflowSpec {
        id: "onboard-ada".into(),
        on_failure: FailurePolicy::Abort,
        steps: vec![
            step("pipedream_crm", "create_contact", json!({"name": "Ada"})),
            step(
                "mailbird",
                "send_email",
                json!({"to": "ada@crm.io", "subject": "welcome"}),
            ),
        ],
    };
    let report = registry.run_workflow(&spec).await;
    assert!(report.completed);
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|s| s.attempts == 1));

    // Re-running the workflow replays the derived step keys instead of
    // re-applying the side effects.
    let report = registry.run_workflow(&spec).await;
    assert!(report.completed);
    let crm = registry.state(&InstanceId::new("pipedream_crm", "acct-1")).unwrap();
    assert_eq!(crm.doc["contacts"].as_array().unwrap().len(), 1);
    let mail = registry.state(&InstanceId::new("mailbird", "acct-1")).unwrap();
    assert_eq!(mail.doc["sentMessages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn workflow_abort_reports_partial_results() {
    let registry = registry();

    let spec = WorkflowSpec {
        id: "wf-abort".into(),
        on_failure: FailurePolicy::Abort,
        steps: vec![
            step("pipedream_crm", "create_contact", json!({"name": "Ada"})),
            // Unauthenticated email instance: auth errors are not retryable.
            step("mailbird", "send_email", json!({"to": "x@y.z"})),
            step("pipedream_crm", "create_contact", json!({"name": "Bob"})),
        ],
    };

    let report = registry.run_workflow(&spec).await;
    assert!(!report.completed);
    // Aborted after the failing step, but the committed first step is
    // still reported.
    assert_eq!(report.steps.len(), 2);
    match &report.steps[0].status {
        StepStatus::Completed { outcome } => assert_eq!(outcome.state_version, 1),
        StepStatus::Failed { error } => panic!("first step should commit, got {error:?}"),
    }
    match &report.steps[1].status {
        StepStatus::Failed { error } => assert_eq!(error.kind, ErrorKind::Auth),
        StepStatus::Completed { .. } => panic!("unauthenticated send should fail"),
    }

    // The abort stopped the third step; Ada's commit stands.
    let crm = registry.state(&InstanceId::new("pipedream_crm", "acct-1")).unwrap();
    assert_eq!(crm.doc["contacts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn workflow_continue_runs_remaining_steps() {
    let registry = registry();

    let spec = WorkflowSpec {
        id: "wf-continue".into(),
        on_failure: FailurePolicy::Continue,
        steps: vec![
            step("mailbird", "send_email", json!({"to": "x@y.z"})),
            step("pipedream_crm", "create_contact", json!({"name": "Ada"})),
        ],
    };

    let report = registry.run_workflow(&spec).await;
    assert!(!report.completed);
    assert_eq!(report.steps.len(), 2);
    assert!(matches!(report.steps[0].status, StepStatus::Failed { .. }));
    let crm = registry.state(&InstanceId::new("pipedream_crm", "acct-1")).unwrap();
    assert_eq!(crm.doc["contacts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn protocol_round_trip() {
    let server = SimulatorServer::new(Arc::new(registry()));
    let session = server.create_session("acct-1");

    assert!(server.list_tools().len() >= 8);
    let described = server.describe_app("mailbird").unwrap();
    assert_eq!(described["app"]["id"], "mailbird");

    server.authenticate(session.id, "mailbird").unwrap();
    let sub = server
        .subscribe_trigger(session.id, "mailbird", "message_received", None)
        .unwrap();

    let response = server
        .call_tool(
            session.id,
            &pantomime_tools::ToolCall {
                name: "mailbird_receive_message".to_string(),
                parameters: json!({"from": "x@y.z"}),
                id: "call-1".to_string(),
            },
        )
        .await;
    assert!(response.success);

    let page = server.poll(sub, 0).unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].seq, 1);
}
