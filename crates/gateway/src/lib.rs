//! HTTP gateway for weft.
//!
//! Serves the v1 API: generations stream as NDJSON, one [`StreamEvent`] per
//! line, and a client that drops its connection can reattach to the running
//! job and receive the full replay followed by live events.
//!
//! Built on Axum.
//!
//! [`StreamEvent`]: weft_core::StreamEvent

pub mod api;
pub mod generation;
pub mod jobs;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{Router, extract::State, response::Json, routing::get};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use weft_agent::{AgentLoop, ApprovalRegistry, LoopSettings, SentinelDetector};
use weft_config::AppConfig;
use weft_core::error::StoreError;
use weft_core::provider::Provider;
use weft_core::store::ChatStore;
use weft_tools::{DelegatedTools, PendingToolCalls};

pub use api::{NDJSON, SharedApiState};
pub use generation::GenerationService;
pub use jobs::{Job, JobInfo, JobRegistry};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("No provider configured: {0}")]
    NoProvider(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open the chat store selected by `persistence.backend`.
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn ChatStore>, StoreError> {
    let path = config.persistence.resolved_path();
    let store: Arc<dyn ChatStore> = match config.persistence.backend.as_str() {
        "memory" => Arc::new(weft_store::InMemoryStore::new()),
        "file" => Arc::new(weft_store::FileStore::new(path)),
        _ => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("create {}: {e}", parent.display())))?;
            }
            Arc::new(weft_store::SqliteStore::new(&path.to_string_lossy()).await?)
        }
    };
    info!(backend = store.name(), "Chat store ready");
    Ok(store)
}

/// Wire every shared subsystem once: registries, tools, loop, generation.
pub fn build_state(config: &AppConfig, provider: Arc<dyn Provider>, store: Arc<dyn ChatStore>) -> SharedApiState {
    let approvals = Arc::new(ApprovalRegistry::new());
    let pending_tools = Arc::new(PendingToolCalls::new());
    let jobs = Arc::new(JobRegistry::new(
        config.stream.heartbeat(),
        config.stream.preempt_wait(),
    ));

    let provider_name = provider.name().to_string();
    let mut agent = AgentLoop::new(provider, LoopSettings::from_config(config)).with_approvals(approvals.clone());
    if config.agent.plan_approval {
        agent = agent.with_detector(Arc::new(SentinelDetector::new(config.agent.plan_marker.clone())));
    }

    let tools = Arc::new(weft_tools::default_registry(&config.tools.enabled_builtins));
    let delegated = Arc::new(DelegatedTools::new(
        config.tools.delegated.iter().map(|t| t.to_definition()).collect(),
        config.tools.delegated_timeout(),
    ));
    let generation = GenerationService::new(store.clone(), Arc::new(agent), tools, jobs.clone())
        .with_delegated(delegated, pending_tools.clone())
        .with_debounce(config.persistence.debounce())
        .with_event_buffer(config.stream.event_buffer);

    Arc::new(api::ApiState {
        store,
        jobs,
        generation: Arc::new(generation),
        approvals,
        pending_tools,
        provider_name,
        start_time: chrono::Utc::now(),
    })
}

/// Build the full router: `/health` plus the v1 API.
///
/// Layers applied:
/// - CORS restricted to the local web client origin
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("http://localhost:8080"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/v1", api::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let router = weft_providers::build_from_config(&config);
    let provider = router.default_provider().ok_or_else(|| {
        GatewayError::NoProvider(format!(
            "'{}' (set an API key or configure [providers])",
            config.default_provider
        ))
    })?;
    let store = open_store(&config).await?;
    let state = build_state(&config, provider, store);

    let app = build_router(state);

    info!(addr = %addr, "Gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub provider: String,
    pub active_jobs: usize,
    pub uptime_secs: i64,
}

async fn health_handler(State(state): State<SharedApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        provider: state.provider_name.clone(),
        active_jobs: state.jobs.len(),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use weft_core::event::StreamEvent;
    use weft_core::message::{Conversation, ConversationId};
    use weft_core::provider::StreamChunk;
    use weft_providers::{ScriptedProvider, ScriptedTurn, scripted_call};
    use weft_store::InMemoryStore;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.persistence.backend = "memory".into();
        config.tools.enabled_builtins = vec!["current_time".into()];
        config
    }

    fn test_state(turns: Vec<ScriptedTurn>) -> (SharedApiState, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let state = build_state(&test_config(), Arc::new(ScriptedProvider::new(turns)), store.clone());
        (state, store)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_events(response: axum::response::Response) -> Vec<StreamEvent> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|l| StreamEvent::from_line(l).unwrap())
            .filter(|e| !e.is_heartbeat())
            .collect()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (state, _) = test_state(vec![]);
        let app = build_router(state);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.provider, "scripted");
        assert_eq!(health.active_jobs, 0);
    }

    #[tokio::test]
    async fn generate_streams_ndjson_to_completion() {
        let (state, store) = test_state(vec![
            ScriptedTurn::tool_calls("", vec![scripted_call("t1", "current_time", serde_json::json!({}))]),
            ScriptedTurn::text(&["It is ", "now."]),
        ]);
        let app = build_router(state);

        let response = app
            .oneshot(post_json("/v1/generate", serde_json::json!({"message": "what time is it?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], NDJSON);

        let events = read_events(response).await;
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["start", "tool-call-start", "tool-call-end", "text-chunk", "text-chunk", "complete"]
        );

        let StreamEvent::Start { conversation_id, .. } = &events[0] else {
            panic!("first event must be start");
        };
        let conv = store
            .get_conversation(&ConversationId::from(conversation_id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conv.last_assistant_text(), Some("It is now."));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (state, _) = test_state(vec![]);
        let response = build_router(state)
            .oneshot(post_json("/v1/generate", serde_json::json!({"message": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reconnect_replays_buffered_events() {
        let (state, _) = test_state(vec![ScriptedTurn::Stall(vec![
            StreamChunk::text("a"),
            StreamChunk::text("b"),
            StreamChunk::text("c"),
        ])]);
        let job = state
            .generation
            .start(Some(ConversationId::from("conv-r")), "go".into())
            .await
            .unwrap();
        while job.event_count() < 4 {
            tokio::task::yield_now().await;
        }

        let app = build_router(state.clone());
        let req = Request::builder()
            .uri("/v1/conversations/conv-r/stream")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.jobs.cancel("conv-r", "test over");
        let events = read_events(response).await;
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["start", "text-chunk", "text-chunk", "text-chunk", "cancel"]);
    }

    #[tokio::test]
    async fn reconnect_without_job_is_404() {
        let (state, _) = test_state(vec![]);
        let req = Request::builder()
            .uri("/v1/conversations/ghost/stream")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_tool_response_and_approval_are_404() {
        let (state, _) = test_state(vec![]);
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(post_json("/v1/tool-responses", serde_json::json!({"call_id": "x", "result": "late"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json(
                "/v1/conversations/none/approval",
                serde_json::json!({"approval_id": "a", "decision": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_response_resolves_pending_call() {
        let (state, _) = test_state(vec![]);
        let reply = state.pending_tools.register("call-7");
        let response = build_router(state)
            .oneshot(post_json(
                "/v1/tool-responses",
                serde_json::json!({"call_id": "call-7", "result": {"path": "/tmp/a"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(reply.await.unwrap(), Ok(r#"{"path":"/tmp/a"}"#.to_string()));
    }

    #[tokio::test]
    async fn conversation_crud() {
        let (state, store) = test_state(vec![]);
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(post_json("/v1/conversations", serde_json::json!({"title": "Trip"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: Conversation = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.title.as_deref(), Some("Trip"));

        let req = Request::builder().uri("/v1/conversations").body(Body::empty()).unwrap();
        let body = app.clone().oneshot(req).await.unwrap().into_body().collect().await.unwrap().to_bytes();
        let list: api::ConversationListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.conversations.len(), 1);

        let uri = format!("/v1/conversations/{}", created.id);
        let req = Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::NO_CONTENT);
        assert!(store.get_conversation(&created.id).await.unwrap().is_none());

        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plan_approval_over_http() {
        let (state, _) = test_state(vec![
            ScriptedTurn::text(&["1. Research\n2. Write\n[PLAN_READY]"]),
            ScriptedTurn::text(&["Written."]),
        ]);
        let job = state
            .generation
            .start(Some(ConversationId::from("conv-p")), "write a report".into())
            .await
            .unwrap();
        let mut sink = job.attach();
        let approval_id = loop {
            match sink.events.recv().await {
                Some(StreamEvent::PlanReady { approval_id, .. }) => break approval_id,
                Some(_) => continue,
                None => panic!("job ended before plan-ready"),
            }
        };

        let response = build_router(state)
            .oneshot(post_json(
                "/v1/conversations/conv-p/approval",
                serde_json::json!({"approval_id": approval_id, "decision": "Skip research"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut last = None;
        while let Some(e) = sink.events.recv().await {
            if !e.is_heartbeat() {
                last = Some(e);
            }
        }
        assert_eq!(
            last,
            Some(StreamEvent::Complete {
                final_text: "Written.".into(),
                grounding: None
            })
        );
    }

    #[tokio::test]
    async fn approval_addressed_to_another_conversation_is_rejected() {
        let (state, _) = test_state(vec![
            ScriptedTurn::text(&["1. Plan\n[PLAN_READY]"]),
            ScriptedTurn::Stall(vec![StreamChunk::text("busy")]),
        ]);
        let planning = state
            .generation
            .start(Some(ConversationId::from("conv-plan")), "plan it".into())
            .await
            .unwrap();
        let mut sink = planning.attach();
        let approval_id = loop {
            match sink.events.recv().await {
                Some(StreamEvent::PlanReady { approval_id, .. }) => break approval_id,
                Some(_) => continue,
                None => panic!("job ended before plan-ready"),
            }
        };
        state
            .generation
            .start(Some(ConversationId::from("conv-other")), "other".into())
            .await
            .unwrap();

        let response = build_router(state.clone())
            .oneshot(post_json(
                "/v1/conversations/conv-other/approval",
                serde_json::json!({"approval_id": approval_id, "decision": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.approvals.is_pending(&approval_id));
        assert!(!planning.is_finished());

        state.jobs.cancel("conv-plan", "test over");
        state.jobs.cancel("conv-other", "test over");
    }
}
