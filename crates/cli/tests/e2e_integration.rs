//! End-to-end tests for weft.
//!
//! A real gateway is served on a loopback port with a scripted provider and
//! an in-memory store; the HTTP client drives it the way `weft chat` does.

use std::sync::Arc;
use std::time::Duration;

use weft_client::{ClientError, EventStream, GatewayClient, Transcript, TranscriptStatus};
use weft_config::{AppConfig, DelegatedToolConfig};
use weft_core::event::StreamEvent;
use weft_core::message::Role;
use weft_core::provider::StreamChunk;
use weft_gateway::SharedApiState;
use weft_providers::{ScriptedProvider, ScriptedTurn, scripted_call};
use weft_store::InMemoryStore;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.persistence.backend = "memory".into();
    config.tools.enabled_builtins = vec!["current_time".into()];
    config
}

async fn spawn_gateway(config: AppConfig, turns: Vec<ScriptedTurn>) -> (GatewayClient, SharedApiState) {
    let store = Arc::new(InMemoryStore::new());
    let state = weft_gateway::build_state(&config, Arc::new(ScriptedProvider::new(turns)), store);
    let app = weft_gateway::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = GatewayClient::new(format!("http://{addr}")).with_reconnect(3, Duration::from_millis(20));
    (client, state)
}

/// Apply events from `stream` until `done` holds or the stream ends.
async fn read_until(stream: &mut EventStream, transcript: &mut Transcript, done: impl Fn(&Transcript) -> bool) {
    while !done(transcript) {
        match stream.next_event().await {
            Some(event) => {
                transcript.apply(&event.unwrap());
            }
            None => break,
        }
    }
}

#[tokio::test]
async fn generation_with_local_tool_streams_and_persists() {
    let (client, _state) = spawn_gateway(
        test_config(),
        vec![
            ScriptedTurn::tool_calls("Checking. ", vec![scripted_call("t1", "current_time", serde_json::json!({}))]),
            ScriptedTurn::text(&["It is ", "late."]),
        ],
    )
    .await;

    let stream = client.generate(None, "what time is it?").await.unwrap();
    let mut follower = client.follow(stream);
    let mut types = Vec::new();
    while let Some(event) = follower.next().await.unwrap() {
        types.push(event.event_type());
    }
    assert_eq!(
        types,
        vec![
            "start",
            "text-chunk",
            "tool-call-start",
            "tool-call-end",
            "text-chunk",
            "text-chunk",
            "complete"
        ]
    );

    let transcript = follower.into_transcript();
    assert_eq!(transcript.final_text(), Some("It is late."));
    assert_eq!(transcript.text(), "Checking. It is late.");
    assert!(transcript.tools()[0].is_complete());

    let conversation_id = transcript.conversation_id().unwrap();
    let conversation = client.get_conversation(conversation_id).await.unwrap();
    assert_eq!(conversation.messages[0].role, Role::User);
    assert_eq!(conversation.last_assistant_text(), Some("It is late."));

    let listed = client.list_conversations(10).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn reconnect_resumes_without_gap_or_duplicate() {
    let (client, state) = spawn_gateway(
        test_config(),
        vec![ScriptedTurn::Stall(vec![
            StreamChunk::text("a"),
            StreamChunk::text("b"),
            StreamChunk::text("c"),
        ])],
    )
    .await;

    let mut transcript = Transcript::new();
    let mut first = client.generate(Some("conv-rc"), "go").await.unwrap();
    read_until(&mut first, &mut transcript, |t| t.text() == "ab").await;
    assert_eq!(transcript.applied(), 3);

    // The client goes away; the job keeps running headless.
    drop(first);
    assert_eq!(state.jobs.len(), 1);

    let mut second = client.attach("conv-rc").await.unwrap();
    transcript.begin_replay();
    read_until(&mut second, &mut transcript, |t| t.text() == "abc").await;

    client.cancel("conv-rc").await.unwrap();
    read_until(&mut second, &mut transcript, Transcript::is_finished).await;

    assert_eq!(transcript.text(), "abc");
    assert_eq!(transcript.status(), &TranscriptStatus::Cancelled("cancelled by user".into()));
}

#[tokio::test]
async fn plan_approval_round_trip() {
    let (client, _state) = spawn_gateway(
        test_config(),
        vec![
            ScriptedTurn::text(&["1. Outline\n2. Draft\n[PLAN_READY]"]),
            ScriptedTurn::text(&["Draft done."]),
        ],
    )
    .await;

    let stream = client.generate(Some("conv-plan"), "write an essay").await.unwrap();
    let mut follower = client.follow(stream);
    while let Some(event) = follower.next().await.unwrap() {
        if let StreamEvent::PlanReady { approval_id, plan } = event {
            assert_eq!(plan, "1. Outline\n2. Draft");
            client.approve("conv-plan", &approval_id, "Keep it short").await.unwrap();
        }
    }
    assert_eq!(follower.transcript().final_text(), Some("Draft done."));

    let conversation = client.get_conversation("conv-plan").await.unwrap();
    assert!(
        conversation
            .messages
            .iter()
            .any(|m| m.role == Role::User && m.content == "Keep it short")
    );
}

#[tokio::test]
async fn denied_plan_ends_with_error() {
    let (client, _state) = spawn_gateway(test_config(), vec![ScriptedTurn::text(&["Plan [PLAN_READY]"])]).await;

    let stream = client.generate(Some("conv-deny"), "do it").await.unwrap();
    let mut follower = client.follow(stream);
    while let Some(event) = follower.next().await.unwrap() {
        if let StreamEvent::PlanReady { approval_id, .. } = event {
            client.deny("conv-deny", &approval_id).await.unwrap();
        }
    }
    assert!(matches!(follower.transcript().status(), TranscriptStatus::Failed(_)));
}

#[tokio::test]
async fn delegated_tool_answered_by_client() {
    let mut config = test_config();
    config.tools.delegated = vec![DelegatedToolConfig {
        name: "pick_file".into(),
        description: "Let the user choose a file".into(),
        parameters: serde_json::json!({"type": "object", "properties": {}}),
    }];
    let (client, _state) = spawn_gateway(
        config,
        vec![
            ScriptedTurn::tool_calls("", vec![scripted_call("f1", "pick_file", serde_json::json!({}))]),
            ScriptedTurn::text(&["Opened it."]),
        ],
    )
    .await;

    let stream = client.generate(None, "open a file").await.unwrap();
    let mut follower = client.follow(stream);
    while let Some(event) = follower.next().await.unwrap() {
        if let StreamEvent::FrontendToolRequest { call_id, name, .. } = event {
            assert_eq!(name, "pick_file");
            client.respond_tool(&call_id, Ok("/home/notes.txt".into())).await.unwrap();
        }
    }

    let transcript = follower.transcript();
    assert_eq!(transcript.final_text(), Some("Opened it."));
    let result = transcript.tools()[0].result.as_ref().unwrap();
    assert_eq!(result.output, "/home/notes.txt");
    assert!(transcript.tool_requests().is_empty());
}

#[tokio::test]
async fn new_request_supersedes_running_stream() {
    let (client, _state) = spawn_gateway(
        test_config(),
        vec![
            ScriptedTurn::Stall(vec![StreamChunk::text("slow")]),
            ScriptedTurn::text(&["fast"]),
        ],
    )
    .await;

    let mut old = Transcript::new();
    let mut old_stream = client.generate(Some("conv-s"), "first").await.unwrap();
    read_until(&mut old_stream, &mut old, |t| t.text() == "slow").await;

    let stream = client.generate(Some("conv-s"), "second").await.unwrap();
    read_until(&mut old_stream, &mut old, Transcript::is_finished).await;
    assert_eq!(old.status(), &TranscriptStatus::Cancelled("superseded".into()));

    let mut follower = client.follow(stream);
    while follower.next().await.unwrap().is_some() {}
    assert_eq!(follower.transcript().final_text(), Some("fast"));
}

#[tokio::test]
async fn attach_without_job_reports_no_active_job() {
    let (client, _state) = spawn_gateway(test_config(), vec![]).await;
    let err = client.attach("nobody").await.err().unwrap();
    assert!(matches!(err, ClientError::NoActiveJob(id) if id == "nobody"));
}
