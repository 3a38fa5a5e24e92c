//! The agentic loop.
//!
//! Each turn streams one model response, forwarding every text delta to the
//! persistence buffer and the job's event channel. A turn then ends the
//! generation (no tool calls), suspends for plan approval, or dispatches its
//! tool calls concurrently and folds the results back into history.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_config::AppConfig;
use weft_core::error::{AgentError, ProviderError, ToolError};
use weft_core::event::StreamEvent;
use weft_core::message::{Message, MessageToolCall, ResponseStatus, ToolResultBlock};
use weft_core::provider::{FinishReason, Provider, ProviderRequest, ToolDefinition};
use weft_core::tool::{ToolCallEvent, ToolDispatch, ToolOutcome};

use crate::approval::{ApprovalDecision, ApprovalRegistry};
use crate::persistence::PersistenceBuffer;
use crate::plan::PlanDetector;

/// Model parameters and limits for one generation.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,

    /// Hard ceiling on provider turns per generation
    pub max_turns: u32,
}

impl LoopSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instruction: None,
            temperature: 0.7,
            max_tokens: None,
            max_turns: 15,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            system_instruction: config.agent.system_instruction.clone(),
            temperature: config.default_temperature,
            max_tokens: Some(config.default_max_tokens),
            max_turns: config.agent.max_turns,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }
}

/// How a generation ended.
#[derive(Debug)]
pub enum LoopOutcome {
    Completed {
        final_text: String,
        grounding: Option<serde_json::Value>,
    },
    Cancelled,
    Failed(AgentError),
}

impl LoopOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Why the loop stopped before completing.
enum Halt {
    Cancelled,
    Failed(AgentError),
}

impl From<ProviderError> for Halt {
    fn from(e: ProviderError) -> Self {
        Self::Failed(e.into())
    }
}

/// Everything one run talks to besides the provider.
pub struct RunContext<'a> {
    pub dispatcher: &'a dyn ToolDispatch,
    pub buffer: &'a PersistenceBuffer,
    pub events: &'a mpsc::Sender<StreamEvent>,
    pub cancel: &'a CancellationToken,
}

impl RunContext<'_> {
    async fn emit(&self, event: StreamEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// What one streamed turn produced.
struct Turn {
    text: String,
    calls: Vec<MessageToolCall>,
    grounding: Option<serde_json::Value>,
    plan_ready: bool,
}

/// The orchestrator. Stateless across runs; one instance can serve every job.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    settings: LoopSettings,
    detector: Option<Arc<dyn PlanDetector>>,
    approvals: Arc<ApprovalRegistry>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, settings: LoopSettings) -> Self {
        Self {
            provider,
            settings,
            detector: None,
            approvals: Arc::new(ApprovalRegistry::new()),
        }
    }

    /// Enable plan approval with the given trigger detector.
    pub fn with_detector(mut self, detector: Arc<dyn PlanDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Share an approval registry with whoever resolves approvals.
    pub fn with_approvals(mut self, approvals: Arc<ApprovalRegistry>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn approvals(&self) -> &Arc<ApprovalRegistry> {
        &self.approvals
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run one generation over `history` to a terminal state.
    ///
    /// The final persistence flush happens before the terminal event is
    /// sent. `complete` or `error` is sent exactly once; on cancellation
    /// nothing further is emitted and the owning job reports the reason.
    pub async fn run(&self, history: Vec<Message>, ctx: RunContext<'_>) -> LoopOutcome {
        let outcome = match self.drive(history, &ctx).await {
            Ok((final_text, grounding)) => LoopOutcome::Completed { final_text, grounding },
            Err(Halt::Cancelled) => LoopOutcome::Cancelled,
            Err(Halt::Failed(e)) => LoopOutcome::Failed(e),
        };

        let flushed = match &outcome {
            LoopOutcome::Completed { grounding, .. } => {
                let grounding = grounding.clone();
                ctx.buffer
                    .complete(|d| d.finish(ResponseStatus::Complete, None, grounding))
                    .await
            }
            LoopOutcome::Cancelled => {
                ctx.buffer
                    .complete(|d| d.finish(ResponseStatus::Cancelled, None, None))
                    .await
            }
            LoopOutcome::Failed(e) => {
                let error = e.to_response_error();
                ctx.buffer
                    .complete(|d| d.finish(ResponseStatus::Failed, Some(error), None))
                    .await
            }
        };
        if let Err(e) = flushed {
            warn!(error = %e, "Final persistence flush failed");
        }

        match &outcome {
            LoopOutcome::Completed { final_text, grounding } => {
                info!(chars = final_text.len(), "Generation complete");
                ctx.emit(StreamEvent::Complete {
                    final_text: final_text.clone(),
                    grounding: grounding.clone(),
                })
                .await;
            }
            LoopOutcome::Failed(e) => {
                warn!(error = %e, "Generation failed");
                ctx.emit(StreamEvent::Error(e.to_response_error())).await;
            }
            LoopOutcome::Cancelled => info!("Generation cancelled"),
        }
        outcome
    }

    async fn drive(
        &self,
        mut history: Vec<Message>,
        ctx: &RunContext<'_>,
    ) -> Result<(String, Option<serde_json::Value>), Halt> {
        let tools = ctx.dispatcher.definitions();
        let mut approval_used = false;

        for turn_number in 1..=self.settings.max_turns {
            if ctx.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            debug!(turn = turn_number, messages = history.len(), "Starting turn");

            let turn = self.stream_turn(&history, &tools, !approval_used, ctx).await?;

            if turn.plan_ready {
                approval_used = true;
                let instruction = self.await_approval(&turn.text, &mut history, ctx).await?;
                history.push(Message::user(instruction.clone()));
                self.checkpoint(ctx, |d| d.push_turn(Message::user(instruction))).await;
                continue;
            }

            if turn.calls.is_empty() {
                return Ok((turn.text, turn.grounding));
            }

            history.push(Message::assistant(turn.text).with_tool_calls(turn.calls.clone()));
            let results = self.execute_tools(&turn.calls, ctx).await;
            if ctx.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            let message = Message::tool_results(results);
            history.push(message.clone());
            self.checkpoint(ctx, |d| d.push_turn(message)).await;
        }

        warn!(max_turns = self.settings.max_turns, "Turn limit reached");
        Err(Halt::Failed(AgentError::TurnLimit(self.settings.max_turns)))
    }

    async fn stream_turn(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        detect: bool,
        ctx: &RunContext<'_>,
    ) -> Result<Turn, Halt> {
        let mut request = ProviderRequest::new(self.settings.model.clone(), history.to_vec());
        request.system = self.settings.system_instruction.clone();
        request.temperature = self.settings.temperature;
        request.max_tokens = self.settings.max_tokens;
        request.tools = tools.to_vec();

        let mut rx = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
            opened = self.provider.stream(request) => opened?,
        };

        let mut turn = Turn {
            text: String::new(),
            calls: Vec::new(),
            grounding: None,
            plan_ready: false,
        };
        let detector = self.detector.as_ref().filter(|_| detect);

        loop {
            let item = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
                item = rx.recv() => item,
            };
            let Some(chunk) = item else { break };
            let chunk = chunk?;

            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                turn.text.push_str(&delta);
                ctx.buffer.add_text(&delta);
                ctx.emit(StreamEvent::TextChunk { text: delta }).await;

                if !turn.plan_ready && detector.is_some_and(|d| d.detect(&turn.text)) {
                    debug!("Plan marker detected");
                    turn.plan_ready = true;
                }
            }
            turn.calls.extend(chunk.tool_calls);
            if chunk.grounding.is_some() {
                turn.grounding = chunk.grounding;
            }
            if let Some(FinishReason::Safety(reason)) = chunk.finish_reason {
                return Err(ProviderError::SafetyBlocked(reason).into());
            }
            if chunk.done {
                break;
            }
        }
        Ok(turn)
    }

    /// Close the plan turn, emit `plan-ready`, and wait for the decision.
    /// Tool calls proposed alongside a plan are not executed.
    async fn await_approval(
        &self,
        text: &str,
        history: &mut Vec<Message>,
        ctx: &RunContext<'_>,
    ) -> Result<String, Halt> {
        history.push(Message::assistant(text));
        self.checkpoint(ctx, |d| d.close_turn(Vec::new())).await;

        let plan = self
            .detector
            .as_ref()
            .map(|d| d.extract_plan(text))
            .unwrap_or_else(|| text.to_string());
        let (approval_id, decision) = self.approvals.begin(ctx.buffer.conversation_id().as_str());
        info!(approval_id = %approval_id, "Suspended for plan approval");
        ctx.emit(StreamEvent::PlanReady {
            approval_id: approval_id.clone(),
            plan,
        })
        .await;

        let decision = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                self.approvals.abandon(&approval_id);
                return Err(Halt::Cancelled);
            }
            decision = decision => decision,
        };

        match decision {
            Ok(ApprovalDecision::Approve(instruction)) => {
                info!(approval_id = %approval_id, "Plan approved");
                Ok(instruction)
            }
            Ok(ApprovalDecision::Deny) => Err(Halt::Failed(AgentError::ApprovalDenied)),
            Err(_) => Err(Halt::Cancelled),
        }
    }

    /// Dispatch every call concurrently. `tool-call-end` events go out in
    /// completion order; the returned results keep the model's call order.
    async fn execute_tools(&self, calls: &[MessageToolCall], ctx: &RunContext<'_>) -> Vec<ToolResultBlock> {
        let started: Vec<ToolCallEvent> = calls.iter().map(ToolCallEvent::start).collect();
        let tracked = started.clone();
        let closed = calls.to_vec();
        self.checkpoint(ctx, move |d| {
            d.close_turn(closed);
            for event in tracked {
                d.record_tool_start(event);
            }
        })
        .await;
        for event in &started {
            ctx.emit(StreamEvent::ToolCallStart(event.clone())).await;
        }
        info!(count = calls.len(), "Dispatching tool calls");

        let mut in_flight: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| async move {
                let outcome = ctx.dispatcher.dispatch(&call.name, &call.arguments, &call.id).await;
                (index, outcome)
            })
            .collect();

        let mut outcomes: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        while let Some((index, outcome)) = in_flight.next().await {
            let mut event = started[index].clone();
            event.complete(outcome.clone());
            outcomes[index] = Some(outcome);

            if !ctx.cancel.is_cancelled() {
                ctx.emit(StreamEvent::ToolCallEnd(event.clone())).await;
            }
            self.checkpoint(ctx, |d| d.record_tool_end(event)).await;
        }

        calls
            .iter()
            .zip(outcomes)
            .map(|(call, outcome)| {
                let outcome = outcome
                    .unwrap_or_else(|| ToolOutcome::failure(&ToolError::Cancelled(call.name.clone())));
                ToolResultBlock {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    is_error: outcome.is_error(),
                    output: outcome.output,
                }
            })
            .collect()
    }

    /// Structural persistence update. Store failures are logged; the
    /// generation carries on and the next checkpoint rewrites everything.
    async fn checkpoint(&self, ctx: &RunContext<'_>, modifier: impl FnOnce(&mut crate::persistence::ResponseDraft)) {
        if let Err(e) = ctx.buffer.update(modifier).await {
            warn!(error = %e, "Persistence checkpoint failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SentinelDetector;
    use async_trait::async_trait;
    use std::time::Duration;
    use weft_core::message::{Conversation, ConversationId, ErrorKind, Role};
    use weft_core::provider::StreamChunk;
    use weft_core::store::ChatStore;
    use weft_providers::{ScriptedProvider, ScriptedTurn, scripted_call};
    use weft_store::InMemoryStore;

    /// Answers `fail` with an error, everything else with `<name>:ok` after
    /// `delay_ms` from the arguments.
    struct MockDispatcher;

    #[async_trait]
    impl ToolDispatch for MockDispatcher {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "lookup".into(),
                description: "Look something up".into(),
                parameters: serde_json::json!({"type": "object"}),
            }]
        }

        async fn dispatch(&self, name: &str, arguments: &str, _call_id: &str) -> ToolOutcome {
            let args: serde_json::Value = serde_json::from_str(arguments).unwrap_or_default();
            let delay = args["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if name == "fail" {
                return ToolOutcome::failure(&ToolError::ExecutionFailed {
                    tool_name: name.into(),
                    reason: "backend down".into(),
                });
            }
            ToolOutcome::success(format!("{name}:ok"))
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        conversation_id: ConversationId,
        buffer: PersistenceBuffer,
        history: Vec<Message>,
        cancel: CancellationToken,
    }

    async fn harness(input: &str) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let mut conv = Conversation::new();
        conv.push(Message::user(input));
        let conversation_id = conv.id.clone();
        let history = conv.messages.clone();
        store.create_conversation(conv).await.unwrap();
        let buffer = PersistenceBuffer::new(
            store.clone(),
            conversation_id.clone(),
            history.clone(),
            Duration::from_millis(1500),
        );
        Harness {
            store,
            conversation_id,
            buffer,
            history,
            cancel: CancellationToken::new(),
        }
    }

    async fn run_collect(agent: &AgentLoop, h: &Harness) -> (LoopOutcome, Vec<StreamEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = agent
            .run(
                h.history.clone(),
                RunContext {
                    dispatcher: &MockDispatcher,
                    buffer: &h.buffer,
                    events: &tx,
                    cancel: &h.cancel,
                },
            )
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (outcome, events)
    }

    fn settings() -> LoopSettings {
        LoopSettings::new("test-model")
    }

    fn types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_type()).collect()
    }

    #[tokio::test]
    async fn single_turn_without_tools() {
        let h = harness("hi").await;
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::text(&["hel", "lo!"])]));
        let agent = AgentLoop::new(provider.clone(), settings());

        let (outcome, events) = run_collect(&agent, &h).await;

        match outcome {
            LoopOutcome::Completed { final_text, .. } => assert_eq!(final_text, "hello!"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(types(&events), vec!["text-chunk", "text-chunk", "complete"]);

        let conv = h.store.get_conversation(&h.conversation_id).await.unwrap().unwrap();
        let last = conv.messages.last().unwrap();
        assert_eq!(last.content, "hello!");
        assert_eq!(last.response.as_ref().unwrap().status, ResponseStatus::Complete);
        assert_eq!(provider.requests()[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn parallel_tools_fold_back_in_call_order() {
        let h = harness("look both up").await;
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedTurn::tool_calls(
                "Checking.",
                vec![
                    scripted_call("a", "lookup", serde_json::json!({"delay_ms": 20})),
                    scripted_call("b", "fail", serde_json::json!({})),
                ],
            ),
            ScriptedTurn::text(&["Done."]),
        ]));
        let agent = AgentLoop::new(provider.clone(), settings());

        let (outcome, events) = run_collect(&agent, &h).await;
        assert!(outcome.is_completed());

        let ends: Vec<&ToolCallEvent> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd(ev) => Some(ev),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 2);
        // b settles first; completion order is preserved on the wire
        assert_eq!(ends[0].id, "b");
        assert!(ends[0].result.as_ref().unwrap().is_error());
        assert_eq!(ends[1].id, "a");

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let tool_turn = requests[1].messages.last().unwrap();
        assert_eq!(tool_turn.role, Role::Tool);
        let ids: Vec<&str> = tool_turn.tool_results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(tool_turn.tool_results[1].is_error);

        let conv = h.store.get_conversation(&h.conversation_id).await.unwrap().unwrap();
        let roles: Vec<Role> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        let meta = conv.messages.last().unwrap().response.clone().unwrap();
        assert_eq!(meta.tool_events.len(), 2);
        assert!(meta.tool_events.iter().all(|e| e.is_complete()));
    }

    #[tokio::test]
    async fn approved_plan_resumes_with_edited_instruction() {
        let h = harness("plan a trip").await;
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedTurn::text(&["1. Book flights\n", "2. Book hotel\n[PLAN_", "READY]"]),
            ScriptedTurn::text(&["Flights booked. [PLAN_READY] again"]),
        ]));
        let agent = AgentLoop::new(provider.clone(), settings())
            .with_detector(Arc::new(SentinelDetector::default()));
        let approvals = agent.approvals().clone();

        let (tx, mut rx) = mpsc::channel(256);
        let run = agent.run(
            h.history.clone(),
            RunContext {
                dispatcher: &MockDispatcher,
                buffer: &h.buffer,
                events: &tx,
                cancel: &h.cancel,
            },
        );
        let answer = async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                if let StreamEvent::PlanReady { approval_id, plan } = &event {
                    assert_eq!(plan, "1. Book flights\n2. Book hotel");
                    assert!(approvals.resolve(
                        h.conversation_id.as_str(),
                        approval_id,
                        ApprovalDecision::Approve("Only book flights".into())
                    ));
                }
                let terminal = event.is_terminal();
                seen.push(event);
                if terminal {
                    break;
                }
            }
            seen
        };
        let (outcome, events) = tokio::join!(run, answer);

        assert!(outcome.is_completed());
        let plan_events = events.iter().filter(|e| e.event_type() == "plan-ready").count();
        assert_eq!(plan_events, 1);

        let requests = provider.requests();
        let injected = requests[1].messages.last().unwrap();
        assert_eq!(injected.role, Role::User);
        assert_eq!(injected.content, "Only book flights");
    }

    #[tokio::test]
    async fn denied_plan_takes_the_error_path() {
        let h = harness("plan").await;
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::text(&["Plan [PLAN_READY]"])]));
        let agent = AgentLoop::new(provider.clone(), settings())
            .with_detector(Arc::new(SentinelDetector::default()));
        let approvals = agent.approvals().clone();

        let (tx, mut rx) = mpsc::channel(256);
        let run = agent.run(
            h.history.clone(),
            RunContext {
                dispatcher: &MockDispatcher,
                buffer: &h.buffer,
                events: &tx,
                cancel: &h.cancel,
            },
        );
        let answer = async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                if let StreamEvent::PlanReady { approval_id, .. } = &event {
                    approvals.resolve(h.conversation_id.as_str(), approval_id, ApprovalDecision::Deny);
                }
                let terminal = event.is_terminal();
                seen.push(event);
                if terminal {
                    break;
                }
            }
            seen
        };
        let (outcome, events) = tokio::join!(run, answer);

        assert!(matches!(outcome, LoopOutcome::Failed(AgentError::ApprovalDenied)));
        assert!(!events.iter().any(|e| e.event_type() == "complete"));
        match events.last().unwrap() {
            StreamEvent::Error(err) => assert_eq!(err.kind, ErrorKind::ApprovalDenied),
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert_eq!(provider.requests().len(), 1);

        let conv = h.store.get_conversation(&h.conversation_id).await.unwrap().unwrap();
        let meta = conv.messages.last().unwrap().response.clone().unwrap();
        assert_eq!(meta.status, ResponseStatus::Failed);
        assert_eq!(meta.error.unwrap().kind, ErrorKind::ApprovalDenied);
    }

    #[tokio::test]
    async fn cancel_mid_stream_flushes_once_and_stops_emitting() {
        let h = harness("write an essay").await;
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::Stall(vec![
            StreamChunk::text("Once "),
            StreamChunk::text("upon"),
        ])]));
        let agent = AgentLoop::new(provider, settings());

        let (tx, mut rx) = mpsc::channel(256);
        let cancel = h.cancel.clone();
        let history = h.history.clone();
        let (agent, buffer, token) = (&agent, &h.buffer, &h.cancel);
        let run = async move {
            let outcome = agent
                .run(
                    history,
                    RunContext {
                        dispatcher: &MockDispatcher,
                        buffer,
                        events: &tx,
                        cancel: token,
                    },
                )
                .await;
            drop(tx);
            outcome
        };
        let watcher = async {
            let mut chunks = 0;
            while let Some(event) = rx.recv().await {
                if matches!(event, StreamEvent::TextChunk { .. }) {
                    chunks += 1;
                    if chunks == 2 {
                        cancel.cancel();
                    }
                }
            }
            chunks
        };
        let (outcome, chunks) = tokio::join!(run, watcher);

        assert!(matches!(outcome, LoopOutcome::Cancelled));
        assert_eq!(chunks, 2);
        assert_eq!(h.buffer.write_count(), 1);

        let conv = h.store.get_conversation(&h.conversation_id).await.unwrap().unwrap();
        let last = conv.messages.last().unwrap();
        assert_eq!(last.content, "Once upon");
        assert_eq!(last.response.as_ref().unwrap().status, ResponseStatus::Cancelled);
    }

    #[tokio::test]
    async fn safety_block_fails_the_generation() {
        let h = harness("bad").await;
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::Chunks(vec![
            Ok(StreamChunk::text("I can")),
            Ok(StreamChunk::finished(FinishReason::Safety("content_filter".into()))),
        ])]));
        let agent = AgentLoop::new(provider, settings());

        let (outcome, events) = run_collect(&agent, &h).await;
        assert!(matches!(outcome, LoopOutcome::Failed(AgentError::Provider(ProviderError::SafetyBlocked(_)))));
        assert_eq!(types(&events), vec!["text-chunk", "error"]);

        let conv = h.store.get_conversation(&h.conversation_id).await.unwrap().unwrap();
        let last = conv.messages.last().unwrap();
        assert_eq!(last.content, "I can");
        assert_eq!(last.response.as_ref().unwrap().error.as_ref().unwrap().kind, ErrorKind::Safety);
    }

    #[tokio::test]
    async fn provider_open_failure_is_an_error() {
        let h = harness("hi").await;
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::OpenError(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let agent = AgentLoop::new(provider, settings());
        let (outcome, events) = run_collect(&agent, &h).await;
        assert!(matches!(outcome, LoopOutcome::Failed(_)));
        assert_eq!(types(&events), vec!["error"]);
    }

    #[tokio::test]
    async fn turn_ceiling_ends_via_error() {
        let h = harness("loop forever").await;
        let looping = || ScriptedTurn::tool_calls("", vec![scripted_call("x", "lookup", serde_json::json!({}))]);
        let provider = Arc::new(ScriptedProvider::new([looping(), looping(), looping()]));
        let agent = AgentLoop::new(provider.clone(), settings().with_max_turns(2));

        let (outcome, events) = run_collect(&agent, &h).await;
        assert!(matches!(outcome, LoopOutcome::Failed(AgentError::TurnLimit(2))));
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(events.last().unwrap().event_type(), "error");
    }

    #[tokio::test]
    async fn cancelled_before_start_never_calls_provider() {
        let h = harness("hi").await;
        h.cancel.cancel();
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::text(&["nope"])]));
        let agent = AgentLoop::new(provider.clone(), settings());
        let (outcome, events) = run_collect(&agent, &h).await;
        assert!(matches!(outcome, LoopOutcome::Cancelled));
        assert!(events.is_empty());
        assert!(provider.requests().is_empty());
    }
}
