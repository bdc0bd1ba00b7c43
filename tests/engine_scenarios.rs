use axum::http::StatusCode;
use axum::Router;
use chatflow::config::EngineConfig;
use chatflow::runtime::{
    ExecutionStatus, FlowService, InboundEvent, InboundOutcome, MemoryTransport, RunOutcome, Subject, WaitType,
};
use chatflow::workflow::{FlowGraph, FlowRegistry, FlowStorage, PublishOutcome};
use chatflow::Database;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct Engine {
    service: FlowService,
    transport: Arc<MemoryTransport>,
}

async fn engine() -> Engine {
    engine_with(EngineConfig { retry_base_delay_ms: 1, ..EngineConfig::default() }).await
}

async fn engine_with(config: EngineConfig) -> Engine {
    let db = Database::in_memory().await.unwrap();
    let registry = Arc::new(FlowRegistry::new(FlowStorage::new(db.pool().clone())));
    let transport = Arc::new(MemoryTransport::new());
    let service = FlowService::new(&db, registry, transport.clone(), &config);
    Engine { service, transport }
}

async fn publish(engine: &Engine, flow: Value) {
    let flow: FlowGraph = serde_json::from_value(flow).unwrap();
    match engine.service.registry().publish(&flow).await.unwrap() {
        PublishOutcome::Published { .. } => {}
        PublishOutcome::Rejected(report) => panic!("flow rejected: {:?}", report.errors),
    }
}

/// Linear flow from `(id, type, config)` nodes chained in order
fn chain(id: &str, nodes: &[(&str, &str, Value)]) -> Value {
    let connections: Vec<Value> = nodes
        .windows(2)
        .enumerate()
        .map(|(i, pair)| json!({"id": format!("c{}", i), "source": pair[0].0, "target": pair[1].0}))
        .collect();
    json!({
        "id": id,
        "name": id,
        "nodes": nodes.iter().map(|(n, t, c)| json!({"id": n, "type": t, "config": c})).collect::<Vec<_>>(),
        "connections": connections,
    })
}

fn contact_flow() -> Value {
    chain(
        "onboarding",
        &[
            ("start", "trigger", json!({"kind": "command", "command": "/start"})),
            ("hi", "message", json!({"text": "Hi"})),
            ("contact", "action", json!({"action": "request_contact", "prompt": "Share your phone"})),
            ("done", "end", json!({"message": "Thanks!"})),
        ],
    )
}

/// Local endpoint answering every request with `status`; returns its URL and a hit counter
async fn stub_endpoint(status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().fallback(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            status
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/orders", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (url, hits)
}

fn orders_flow(url: &str) -> Value {
    chain(
        "orders",
        &[
            ("start", "trigger", json!({"kind": "command", "command": "/orders"})),
            ("fetch", "action", json!({"action": "http_request", "url": url})),
            ("done", "end", json!({"message": "Fetched"})),
        ],
    )
}

fn started_context(outcome: InboundOutcome) -> (String, RunOutcome) {
    match outcome {
        InboundOutcome::Started { mut runs } => {
            assert_eq!(runs.len(), 1);
            let run = runs.remove(0);
            (run.context_id, run.outcome)
        }
        other => panic!("expected a start, got {:?}", other),
    }
}

#[tokio::test]
async fn start_suspends_at_contact_and_contact_event_completes() {
    let engine = engine().await;
    publish(&engine, contact_flow()).await;

    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/start")).await.unwrap());
    assert_eq!(
        outcome,
        RunOutcome::Waiting { node_id: "contact".into(), wait_type: WaitType::Contact }
    );

    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Waiting);
    assert_eq!(status.wait_type, WaitType::Contact);
    assert_eq!(status.current_node_id.as_deref(), Some("contact"));
    assert_eq!(engine.transport.texts(), vec!["Hi", "Share your phone"]);

    let resumed = engine
        .service
        .resume_on_event(&InboundEvent::contact("u1", "c1", "+15551234567"))
        .await
        .unwrap();
    assert!(resumed);

    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Thanks!"));

    let vars = engine.service.session_variables(&context_id).await.unwrap();
    assert_eq!(vars.get("contact_phone"), Some(&json!("+15551234567")));
}

#[tokio::test]
async fn contact_matching_an_existing_subject_links_it() {
    let engine = engine().await;
    publish(&engine, contact_flow()).await;
    let subject_id = engine
        .service
        .subjects()
        .register(Some("Ada"), Some("+1 (555) 123-4567"), None)
        .await
        .unwrap();

    let (context_id, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/start")).await.unwrap());
    engine
        .service
        .handle_inbound(&InboundEvent::contact("u1", "c1", "15551234567"))
        .await
        .unwrap();

    let vars = engine.service.session_variables(&context_id).await.unwrap();
    assert_eq!(vars.get("linked_subject_id"), Some(&json!(subject_id)));
    assert_eq!(vars["contact_match"]["status"], json!("matched"));
}

#[tokio::test]
async fn duplicate_events_advance_the_graph_once() {
    let engine = engine().await;
    publish(
        &engine,
        chain(
            "greet",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/start"})),
                ("ask", "wait_input", json!({"prompt": "Your name?", "variable": "name"})),
                ("hello", "message", json!({"text": "Hello {name}"})),
                ("done", "end", json!({})),
            ],
        ),
    )
    .await;

    let (context_id, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/start")).await.unwrap());

    let event = InboundEvent::message("u1", "c1", "Ada");
    let (first, second) = tokio::join!(engine.service.resume_on_event(&event), engine.service.resume_on_event(&event));
    let resumed = [first.unwrap(), second.unwrap()];
    assert_eq!(resumed.iter().filter(|r| **r).count(), 1);

    let greetings = engine.transport.texts().into_iter().filter(|t| t == "Hello Ada").count();
    assert_eq!(greetings, 1);
    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn cycle_without_exit_fails_at_the_step_cap() {
    let engine = engine().await;
    publish(
        &engine,
        json!({
            "id": "spin",
            "name": "spin",
            "nodes": [
                {"id": "start", "type": "trigger", "config": {"kind": "command", "command": "/spin"}},
                {"id": "a", "type": "message", "config": {"text": "a"}},
                {"id": "b", "type": "message", "config": {"text": "b"}},
                {"id": "c", "type": "message", "config": {"text": "c"}}
            ],
            "connections": [
                {"id": "c0", "source": "start", "target": "a"},
                {"id": "c1", "source": "a", "target": "b"},
                {"id": "c2", "source": "b", "target": "c"},
                {"id": "c3", "source": "c", "target": "a"}
            ]
        }),
    )
    .await;
    let warnings = engine.service.registry().get_active("spin").unwrap().warnings.clone();
    assert!(warnings.iter().any(|w| w.message.contains("no end node")));

    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/spin")).await.unwrap());
    assert!(matches!(outcome, RunOutcome::Failed { ref error } if error.contains("loop detected")));

    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.step_count, 500);
    let last = engine.transport.texts().pop().unwrap();
    assert!(last.contains("/start"), "subject should be told how to restart, got {:?}", last);
}

#[tokio::test]
async fn condition_routes_numeric_input_on_true_and_false_edges() {
    let engine = engine().await;
    publish(
        &engine,
        json!({
            "id": "size",
            "name": "size",
            "nodes": [
                {"id": "start", "type": "trigger", "config": {"kind": "command", "command": "/size"}},
                {"id": "ask", "type": "wait_input", "config": {"variable": "amount"}},
                {"id": "check", "type": "condition", "config": {"variable": "amount", "operator": "greater", "value": 100}},
                {"id": "big", "type": "message", "config": {"text": "big"}},
                {"id": "small", "type": "message", "config": {"text": "small"}},
                {"id": "done", "type": "end", "config": {}}
            ],
            "connections": [
                {"id": "c0", "source": "start", "target": "ask"},
                {"id": "c1", "source": "ask", "target": "check"},
                {"id": "c2", "source": "check", "target": "big", "label": "true"},
                {"id": "c3", "source": "check", "target": "small", "label": "false"},
                {"id": "c4", "source": "big", "target": "done"},
                {"id": "c5", "source": "small", "target": "done"}
            ]
        }),
    )
    .await;

    for (user, answer, expected) in [("u1", "150", "big"), ("u2", "50", "small")] {
        engine.service.handle_inbound(&InboundEvent::message(user, user, "/size")).await.unwrap();
        engine.service.handle_inbound(&InboundEvent::message(user, user, answer)).await.unwrap();
        assert_eq!(engine.transport.texts().last().map(String::as_str), Some(expected));
    }
}

#[tokio::test]
async fn only_one_active_context_per_flow_and_subject() {
    let engine = engine().await;
    publish(&engine, contact_flow()).await;
    let subject = Subject::new("u1", "c1");

    engine.service.start_flow("onboarding", &subject, None).await.unwrap();
    let err = engine.service.start_flow("onboarding", &subject, None).await.unwrap_err();
    assert!(err.is_conflict());

    // A repeated command restarts instead
    let (restarted, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/start")).await.unwrap());
    let status = engine.service.get_execution_status(&restarted).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Waiting);
}

#[tokio::test]
async fn cancelled_context_ignores_events_and_can_restart_from_a_node() {
    let engine = engine().await;
    publish(
        &engine,
        chain(
            "survey",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/survey"})),
                ("set", "action", json!({"action": "set_variable", "name": "topic", "value": "pets"})),
                ("ask", "wait_input", json!({"prompt": "Favourite {topic}?", "variable": "answer"})),
                ("done", "end", json!({"message": "Noted {answer}"})),
            ],
        ),
    )
    .await;

    let (context_id, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/survey")).await.unwrap());
    assert!(engine.service.cancel_execution(&context_id).await.unwrap());
    assert!(!engine.service.cancel_execution(&context_id).await.unwrap());

    let outcome = engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "cats")).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Ignored);

    let restarted = engine.service.restart_from_node(&context_id, "ask", false).await.unwrap();
    assert_ne!(restarted.context_id, context_id);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Favourite pets?"));

    engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "cats")).await.unwrap();
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Noted cats"));

    let trace = engine.service.trace(&restarted.context_id).await.unwrap();
    let nodes: Vec<&str> = trace.iter().map(|t| t.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["ask", "done"]);
}

#[tokio::test]
async fn expired_wait_follows_the_timeout_edge() {
    let engine = engine().await;
    publish(
        &engine,
        json!({
            "id": "quick",
            "name": "quick",
            "nodes": [
                {"id": "start", "type": "trigger", "config": {"kind": "command", "command": "/quick"}},
                {"id": "ask", "type": "wait_callback", "config": {
                    "prompt": "Pick one", "timeout_secs": 1,
                    "buttons": [{"text": "A", "callback_data": "a"}]
                }},
                {"id": "late", "type": "message", "config": {"text": "Too slow"}},
                {"id": "done", "type": "end", "config": {}}
            ],
            "connections": [
                {"id": "c0", "source": "start", "target": "ask"},
                {"id": "c1", "source": "ask", "target": "done"},
                {"id": "c2", "source": "ask", "target": "late", "label": "timeout"},
                {"id": "c3", "source": "late", "target": "done"}
            ]
        }),
    )
    .await;

    let (context_id, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/quick")).await.unwrap());
    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert!(status.wait_deadline.is_some());

    // Not due yet
    assert!(engine.service.sweep_at(Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + Duration::seconds(2);
    let swept = engine.service.sweep_at(later).await.unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].0, context_id);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Too slow"));
    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);

    // Nothing left to sweep
    assert!(engine.service.sweep_at(later).await.unwrap().is_empty());
}

#[tokio::test]
async fn unrecoverable_failure_escalates_to_the_fallback_flow() {
    let engine = engine().await;
    publish(
        &engine,
        chain(
            "orders",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/orders"})),
                ("fetch", "action", json!({"action": "http_request", "url": "http://127.0.0.1:9/orders"})),
                ("done", "end", json!({})),
            ],
        ),
    )
    .await;
    publish(
        &engine,
        chain(
            "help",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/help"})),
                ("human", "message", json!({"text": "A human will contact you"})),
                ("done", "end", json!({})),
            ],
        ),
    )
    .await;
    engine.service.projects().set_fallback_flow("default", Some("help")).await.unwrap();

    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/orders")).await.unwrap());
    let RunOutcome::Escalated { fallback_context_id } = outcome else {
        panic!("expected escalation, got {:?}", outcome);
    };

    let failed = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    let fallback = engine.service.get_execution_status(&fallback_context_id).await.unwrap();
    assert_eq!(fallback.flow_id, "help");
    assert_eq!(fallback.status, ExecutionStatus::Completed);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("A human will contact you"));

    let vars = engine.service.session_variables(&fallback_context_id).await.unwrap();
    assert!(vars.contains_key("last_error"));
}

#[tokio::test]
async fn rejected_input_reprompts_and_keeps_the_deadline() {
    let engine = engine().await;
    publish(
        &engine,
        chain(
            "login",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/login"})),
                ("ask", "wait_input", json!({
                    "prompt": "Your PIN?", "variable": "pin", "timeout_secs": 600,
                    "pattern": r"^\d{4}$", "invalid_message": "Four digits please"
                })),
                ("done", "end", json!({"message": "Welcome"})),
            ],
        ),
    )
    .await;

    let (context_id, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/login")).await.unwrap());

    let outcome = engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "abc")).await.unwrap();
    assert!(matches!(
        outcome,
        InboundOutcome::Resumed { outcome: RunOutcome::Waiting { ref node_id, wait_type: WaitType::Input }, .. }
            if node_id == "ask"
    ));
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Four digits please"));

    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Waiting);
    assert_eq!(status.current_node_id.as_deref(), Some("ask"));
    assert!(status.wait_deadline.is_some_and(|deadline| deadline > Utc::now()));
    let vars = engine.service.session_variables(&context_id).await.unwrap();
    assert!(!vars.contains_key("pin"));

    engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "1234")).await.unwrap();
    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Welcome"));
    let vars = engine.service.session_variables(&context_id).await.unwrap();
    assert_eq!(vars.get("pin"), Some(&json!("1234")));
}

#[tokio::test]
async fn callback_resume_enters_the_matching_callback_trigger() {
    let engine = engine().await;
    publish(
        &engine,
        json!({
            "id": "shop",
            "name": "shop",
            "nodes": [
                {"id": "start", "type": "trigger", "config": {"kind": "command", "command": "/shop"}},
                {"id": "menu", "type": "wait_callback", "config": {
                    "prompt": "What next?",
                    "buttons": [{"text": "Buy", "callback_data": "buy"}, {"text": "Info", "callback_data": "info"}]
                }},
                {"id": "info", "type": "message", "config": {"text": "We sell socks"}},
                {"id": "on_buy", "type": "trigger", "config": {"kind": "callback", "callback_data": "buy"}},
                {"id": "cart", "type": "message", "config": {"text": "Added to cart"}},
                {"id": "done", "type": "end", "config": {}}
            ],
            "connections": [
                {"id": "c0", "source": "start", "target": "menu"},
                {"id": "c1", "source": "menu", "target": "info", "label": "info"},
                {"id": "c2", "source": "info", "target": "done"},
                {"id": "c3", "source": "on_buy", "target": "cart"},
                {"id": "c4", "source": "cart", "target": "done"}
            ]
        }),
    )
    .await;

    let (context_id, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/shop")).await.unwrap());
    let outcome = engine.service.handle_inbound(&InboundEvent::callback("u1", "c1", "buy")).await.unwrap();
    assert!(matches!(outcome, InboundOutcome::Resumed { context_id: ref id, outcome: RunOutcome::Completed } if *id == context_id));
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Added to cart"));

    let trace = engine.service.trace(&context_id).await.unwrap();
    let nodes: Vec<&str> = trace.iter().map(|t| t.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["start", "menu", "on_buy", "cart", "done"]);
    let vars = engine.service.session_variables(&context_id).await.unwrap();
    assert_eq!(vars.get("callback_data"), Some(&json!("buy")));

    // A button without a trigger follows the wait node's labeled edge
    let (second, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u2", "c2", "/shop")).await.unwrap());
    engine.service.handle_inbound(&InboundEvent::callback("u2", "c2", "info")).await.unwrap();
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("We sell socks"));
    let status = engine.service.get_execution_status(&second).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn delay_is_resumed_by_the_sweep_not_by_messages() {
    let engine = engine().await;
    publish(
        &engine,
        chain(
            "nudge",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/nudge"})),
                ("pause", "delay", json!({"seconds": 1})),
                ("later", "message", json!({"text": "Still there?"})),
                ("done", "end", json!({})),
            ],
        ),
    )
    .await;

    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/nudge")).await.unwrap());
    assert_eq!(outcome, RunOutcome::Waiting { node_id: "pause".into(), wait_type: WaitType::Delay });

    let ignored = engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "hello?")).await.unwrap();
    assert_eq!(ignored, InboundOutcome::Ignored);

    let swept = engine.service.sweep_at(Utc::now() + Duration::seconds(2)).await.unwrap();
    assert_eq!(swept, vec![(context_id.clone(), RunOutcome::Completed)]);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("Still there?"));
    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn transient_failures_retry_with_backoff_before_failing() {
    let engine = engine_with(EngineConfig {
        retry_max_attempts: 3,
        retry_base_delay_ms: 20,
        ..EngineConfig::default()
    })
    .await;
    let (url, hits) = stub_endpoint(StatusCode::SERVICE_UNAVAILABLE).await;
    publish(&engine, orders_flow(&url)).await;

    let started = Instant::now();
    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/orders")).await.unwrap());
    let elapsed = started.elapsed();

    assert!(matches!(outcome, RunOutcome::Failed { ref error } if error.contains("503")), "got {:?}", outcome);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    // Backoff of 20ms then 40ms between the three attempts
    assert!(elapsed >= std::time::Duration::from_millis(60), "retried too fast: {:?}", elapsed);

    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Failed);
    let trace = engine.service.trace(&context_id).await.unwrap();
    let fetch = trace.iter().find(|t| t.node_id == "fetch").unwrap();
    assert_eq!(fetch.status, "error");
}

#[tokio::test]
async fn authorization_failure_aborts_without_retry_or_fallback() {
    let engine = engine().await;
    let (url, hits) = stub_endpoint(StatusCode::UNAUTHORIZED).await;
    publish(&engine, orders_flow(&url)).await;
    publish(
        &engine,
        chain(
            "help",
            &[
                ("start", "trigger", json!({"kind": "command", "command": "/help"})),
                ("human", "message", json!({"text": "A human will contact you"})),
                ("done", "end", json!({})),
            ],
        ),
    )
    .await;
    engine.service.projects().set_fallback_flow("default", Some("help")).await.unwrap();

    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "/orders")).await.unwrap());
    assert!(matches!(outcome, RunOutcome::Failed { .. }), "got {:?}", outcome);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let status = engine.service.get_execution_status(&context_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Failed);
    let texts = engine.transport.texts();
    assert_eq!(texts.last(), Some(&EngineConfig::default().auth_failure_message));
    assert!(!texts.iter().any(|t| t == "A human will contact you"));
}

#[tokio::test]
async fn numeric_variables_survive_storage_and_drive_conditions() {
    let engine = engine().await;
    publish(
        &engine,
        json!({
            "id": "tier",
            "name": "tier",
            "variables": [{"name": "limit", "scope": "session", "initial": 100}],
            "nodes": [
                {"id": "start", "type": "trigger", "config": {"kind": "text", "text": "go"}},
                {"id": "set", "type": "action", "config": {"action": "set_variable", "name": "amount", "value": 150}},
                {"id": "check", "type": "condition", "config": {"variable": "amount", "operator": "greater", "value": 100}},
                {"id": "big", "type": "end", "config": {"message": "big {amount}/{limit}"}},
                {"id": "small", "type": "end", "config": {"message": "small"}}
            ],
            "connections": [
                {"id": "c0", "source": "start", "target": "set"},
                {"id": "c1", "source": "set", "target": "check"},
                {"id": "c2", "source": "check", "target": "big", "label": "true"},
                {"id": "c3", "source": "check", "target": "small", "label": "false"}
            ]
        }),
    )
    .await;

    let (context_id, outcome) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "go")).await.unwrap());
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(engine.transport.texts().last().map(String::as_str), Some("big 150/100"));

    let vars = engine.service.session_variables(&context_id).await.unwrap();
    assert_eq!(vars.get("amount"), Some(&json!(150)));
    assert_eq!(vars.get("limit"), Some(&json!(100)));

    // A finished run leaves the trigger free for the next one
    let (again, _) =
        started_context(engine.service.handle_inbound(&InboundEvent::message("u1", "c1", "go")).await.unwrap());
    assert_ne!(again, context_id);
}
