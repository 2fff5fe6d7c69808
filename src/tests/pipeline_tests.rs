//! End-to-end request pipeline tests against scripted backends.

use crate::config::Config;
use crate::events::{EventType, Stage, UnifiedEvent};
use crate::manager::MessageOptions;
use crate::models::{SourceFragment, TaskState};
use crate::retrieval::VectorStore;
use crate::system::System;
use crate::tests::helpers::{ScriptedProvider, StubStore};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn test_system(provider: Arc<ScriptedProvider>) -> (System, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_tests(dir.path().to_path_buf());
    let system = System::assemble_with_provider(config, provider)
        .await
        .unwrap();
    system.spawn_scheduler();
    (system, dir)
}

async fn drain_events(rx: &mut broadcast::Receiver<UnifiedEvent>) -> Vec<UnifiedEvent> {
    let mut events = Vec::new();
    while let Ok(result) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        match result {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
    }
    events
}

fn classifier_verdict(intent: &str, confidence: f64) -> String {
    format!(r#"{{"intent": "{intent}", "confidence": {confidence}, "reason": "scripted"}}"#)
}

// Scenario: casual greeting. init → classifying → executing → result, no
// retrieval, at most one model call.
#[tokio::test]
async fn greeting_takes_the_fast_path() {
    let provider = ScriptedProvider::new(vec![Ok("Hello! How can I help today?".to_string())]);
    let (system, _dir) = test_system(provider.clone()).await;

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    system
        .manager
        .run_request(&session.id, "req-1", "hi", MessageOptions::default())
        .await
        .unwrap();

    let events = drain_events(&mut rx).await;
    let stages: Vec<(EventType, Stage)> =
        events.iter().map(|e| (e.event_type, e.stage)).collect();
    assert_eq!(
        stages,
        vec![
            (EventType::Init, Stage::Init),
            (EventType::Status, Stage::Classifying),
            (EventType::Status, Stage::Executing),
            (EventType::Result, Stage::Complete),
        ]
    );

    let classifying = &events[1];
    assert_eq!(classifying.metadata.intent.as_deref(), Some("casual_chat"));
    let executing = &events[2];
    assert_eq!(executing.agent.name, "casual_chat");
    let result = &events[3];
    assert!(!result.content.answer.as_deref().unwrap_or("").is_empty());
    assert!(result.content.sources.is_empty());
    assert!(events.iter().all(|e| e.stage != Stage::Retrieval));

    // Greeting fast path plus skipped validation: one generation total.
    assert_eq!(provider.call_count(), 1);

    // The user and assistant turns landed in the session.
    let snapshot = system.sessions.snapshot(&session.id).await.unwrap();
    assert_eq!(snapshot.turns.len(), 2);
}

// Scenario: knowledge lookup across two stores with deduplication.
#[tokio::test]
async fn knowledge_lookup_merges_stores_deterministically() {
    let provider = ScriptedProvider::new(vec![
        Ok(classifier_verdict("knowledge_lookup", 0.95)),
        Ok("Per [a1], X is the usual suspect.".to_string()),
        Ok(r#"{"addresses": true, "issues": []}"#.to_string()),
    ]);
    let (system, _dir) = test_system(provider.clone()).await;

    system
        .stores
        .register(
            "alpha",
            "primary corpus",
            StubStore::new(vec![("a1", 0.9), ("a2", 0.4)]),
        )
        .await
        .unwrap();
    system
        .stores
        .register(
            "beta",
            "secondary corpus",
            StubStore::new(vec![("a1", 0.8), ("b1", 0.6)]),
        )
        .await
        .unwrap();

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    let options = MessageOptions {
        stores: Some(vec!["alpha".to_string(), "beta".to_string()]),
        top_k: Some(3),
        ..MessageOptions::default()
    };
    system
        .manager
        .run_request(&session.id, "req-2", "What is X?", options)
        .await
        .unwrap();

    let events = drain_events(&mut rx).await;
    let result = events
        .iter()
        .find(|e| e.event_type == EventType::Result)
        .expect("result event");

    let merged: Vec<(&str, f64)> = result
        .content
        .sources
        .iter()
        .map(|s| (s.document_id.as_str(), s.score))
        .collect();
    assert_eq!(merged, vec![("a1", 0.9), ("b1", 0.6), ("a2", 0.4)]);

    // Result sources are a subset of what retrieval saw.
    let retrieval_sources: Vec<&SourceFragment> = events
        .iter()
        .filter(|e| e.stage == Stage::Retrieval)
        .flat_map(|e| e.content.sources.iter())
        .collect();
    for source in &result.content.sources {
        assert!(retrieval_sources
            .iter()
            .any(|r| r.document_id == source.document_id));
    }
}

// Scenario: retry-with-feedback. First answer lacks a citation, the second
// passes. Two executing events, one retrying status, one result.
#[tokio::test]
async fn validation_failure_retries_with_feedback() {
    let provider = ScriptedProvider::new(vec![
        Ok(classifier_verdict("knowledge_lookup", 0.9)),
        Ok("X is a thing, trust me.".to_string()),
        Ok("X is a thing, per [a1].".to_string()),
        Ok(r#"{"addresses": true, "issues": []}"#.to_string()),
    ]);
    let (system, _dir) = test_system(provider.clone()).await;
    system
        .stores
        .register("alpha", "corpus", StubStore::new(vec![("a1", 0.9)]))
        .await
        .unwrap();

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    let options = MessageOptions {
        stores: Some(vec!["alpha".to_string()]),
        ..MessageOptions::default()
    };
    system
        .manager
        .run_request(&session.id, "req-3", "What is X?", options)
        .await
        .unwrap();

    let events = drain_events(&mut rx).await;
    let executing = events
        .iter()
        .filter(|e| e.event_type == EventType::Status && e.stage == Stage::Executing)
        .filter(|e| e.metadata.handler.is_some())
        .count();
    assert_eq!(executing, 2);

    let retrying = events
        .iter()
        .filter(|e| e.content.message == "retrying")
        .count();
    assert_eq!(retrying, 1);

    let results: Vec<&UnifiedEvent> = events
        .iter()
        .filter(|e| e.event_type == EventType::Result)
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].stage, Stage::Complete);
    assert!(results[0]
        .content
        .answer
        .as_deref()
        .unwrap()
        .contains("[a1]"));

    let task = system.scheduler.get_task("req-3").await.unwrap();
    assert_eq!(task.retry_count, 1);
}

/// Store that answers slowly enough for an interrupt to land mid-flight.
struct SlowStore {
    inner: Arc<StubStore>,
}

#[async_trait]
impl VectorStore for SlowStore {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SourceFragment>> {
        tokio::time::sleep(Duration::from_millis(400)).await;
        self.inner.similarity_search(query, k).await
    }
    async fn document_count(&self) -> u64 {
        self.inner.document_count().await
    }
}

// Scenario: interrupt mid-retrieval. The next suspension point observes the
// cancellation; no events after the interruption status.
#[tokio::test]
async fn interrupt_mid_retrieval_is_terminal() {
    let provider = ScriptedProvider::new(vec![
        Ok(classifier_verdict("knowledge_lookup", 0.9)),
        Ok("never used".to_string()),
    ]);
    let (system, _dir) = test_system(provider).await;
    system
        .stores
        .register(
            "alpha",
            "slow corpus",
            Arc::new(SlowStore {
                inner: StubStore::new(vec![("a1", 0.9)]),
            }),
        )
        .await
        .unwrap();

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    let options = MessageOptions {
        stores: Some(vec!["alpha".to_string()]),
        ..MessageOptions::default()
    };
    let request_id = system
        .manager
        .submit_message(&session.id, "What is X?", options)
        .await
        .unwrap();

    // Wait until the knowledge task is running, then interrupt.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("executing event before timeout")
            .unwrap();
        if event.stage == Stage::Executing && event.metadata.handler.is_some() {
            break;
        }
    }
    system.manager.interrupt_task(&request_id).await.unwrap();

    let completion = system.scheduler.wait(&request_id).await.unwrap();
    assert_eq!(completion.state, TaskState::Interrupted);

    let events = drain_events(&mut rx).await;
    let interrupted_at = events
        .iter()
        .position(|e| e.content.message == "interrupted")
        .expect("interruption status event");
    assert_eq!(interrupted_at, events.len() - 1, "no events after interrupt");
    assert!(events.iter().all(|e| e.event_type != EventType::Result));
}

// Scenario: invalid store name is rejected before any backend call.
#[tokio::test]
async fn invalid_store_name_is_bad_input_without_backend_call() {
    let provider = ScriptedProvider::new(vec![Ok(classifier_verdict("knowledge_lookup", 0.9))]);
    let (system, _dir) = test_system(provider).await;
    let store = StubStore::new(vec![("a1", 0.9)]);
    system
        .stores
        .register("alpha", "corpus", store.clone())
        .await
        .unwrap();

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    let options = MessageOptions {
        stores: Some(vec!["../etc".to_string()]),
        ..MessageOptions::default()
    };
    system
        .manager
        .run_request(&session.id, "req-6", "What is X?", options)
        .await
        .unwrap();

    let events = drain_events(&mut rx).await;
    let error = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("error event");
    assert_eq!(error.stage, Stage::Failed);
    assert_eq!(error.content.data.as_ref().unwrap()["kind"], "bad_input");

    assert_eq!(
        store.searches.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "no backend call for an invalid store name"
    );
}

// Plan-and-execute: multi-step plan with synthesis.
#[tokio::test]
async fn multi_step_plan_synthesizes_step_outputs() {
    let provider = ScriptedProvider::new(vec![
        Ok(classifier_verdict("plan_and_execute", 0.9)),
        Ok(r#"[{"agent": "knowledge", "input": "background on Y"},
               {"agent": "summarize", "input": "condense the findings"}]"#
            .to_string()),
        Ok("Y was invented in 1970, per [y1].".to_string()),
        Ok("Summary: Y dates to 1970.".to_string()),
        Ok("In short, Y is a 1970s invention [y1].".to_string()),
        Ok(r#"{"addresses": true, "issues": []}"#.to_string()),
    ]);
    let (system, _dir) = test_system(provider).await;
    system
        .stores
        .register("alpha", "corpus", StubStore::new(vec![("y1", 0.9)]))
        .await
        .unwrap();

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    system
        .manager
        .run_request(
            &session.id,
            "req-7",
            "research Y and summarize the findings",
            MessageOptions::default(),
        )
        .await
        .unwrap();

    let events = drain_events(&mut rx).await;
    let planning = events
        .iter()
        .find(|e| e.stage == Stage::Planning)
        .expect("planning event");
    assert!(planning.content.message.contains("2 step(s)"));

    let progress: Vec<(usize, usize)> = events
        .iter()
        .filter(|e| e.event_type == EventType::Progress && e.stage == Stage::Executing)
        .map(|e| {
            (
                e.metadata.step_index.unwrap(),
                e.metadata.total_steps.unwrap(),
            )
        })
        .collect();
    assert_eq!(progress, vec![(1, 2), (2, 2)]);

    assert!(events.iter().any(|e| e.stage == Stage::Synthesis));

    let result = events
        .iter()
        .find(|e| e.event_type == EventType::Result)
        .expect("result event");
    assert_eq!(
        result.content.answer.as_deref(),
        Some("In short, Y is a 1970s invention [y1].")
    );
    // Sources from the retrieval step survive through synthesis.
    assert!(result
        .content
        .sources
        .iter()
        .any(|s| s.document_id == "y1"));
}

// Classifier collapse: empty-ish input still completes via the chat path.
#[tokio::test]
async fn unknown_intent_falls_back_to_chat() {
    let provider = ScriptedProvider::new(vec![
        Ok("unparsable".to_string()),
        Ok("still unparsable".to_string()),
        Ok("I'm not sure what you mean, could you rephrase?".to_string()),
    ]);
    let (system, _dir) = test_system(provider).await;

    let session = system.sessions.create(None).await.unwrap();
    let mut rx = system.bus.subscribe(&session.id).await;

    system
        .manager
        .run_request(
            &session.id,
            "req-8",
            "zzzz qqqq wwww eeee rrrr",
            MessageOptions::default(),
        )
        .await
        .unwrap();

    let events = drain_events(&mut rx).await;
    let classifying = events
        .iter()
        .find(|e| e.stage == Stage::Classifying)
        .unwrap();
    assert_eq!(classifying.metadata.intent.as_deref(), Some("unknown"));
    let result = events
        .iter()
        .find(|e| e.event_type == EventType::Result)
        .expect("result event");
    assert_eq!(result.metadata.handler.as_deref(), Some("casual_chat"));
}

// HTTP surface smoke test: health, session creation, submission.
#[tokio::test]
async fn api_accepts_messages_and_reports_status() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    let provider = ScriptedProvider::always("ok");
    let (system, _dir) = test_system(provider).await;
    let api = crate::api::ApiServer::new(&system.config, &system);
    let router = api.build_router();

    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"session_id": "sess-api"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router
        .clone()
        .oneshot(
            Request::post("/sessions/sess-api/messages")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"text": "hello there"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Empty text is rejected up front.
    let response = router
        .clone()
        .oneshot(
            Request::post("/sessions/sess-api/messages")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"text": "   "}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(Request::get("/system/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
