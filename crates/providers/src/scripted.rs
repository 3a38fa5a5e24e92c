//! A provider that replays canned turns.
//!
//! Each call to `stream` pops the next [`ScriptedTurn`]. Used to drive the
//! loop without a network in tests and offline demos.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use weft_core::error::ProviderError;
use weft_core::message::MessageToolCall;
use weft_core::provider::*;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these items in order, then close.
    Chunks(Vec<Result<StreamChunk, ProviderError>>),

    /// Fail when the stream is opened.
    OpenError(ProviderError),

    /// Stream these chunks, then stay open without finishing.
    Stall(Vec<StreamChunk>),
}

impl ScriptedTurn {
    /// Text deltas followed by a `Stop` finish.
    pub fn text(deltas: &[&str]) -> Self {
        let mut chunks: Vec<_> = deltas.iter().map(|d| Ok(StreamChunk::text(*d))).collect();
        chunks.push(Ok(StreamChunk::finished(FinishReason::Stop)));
        Self::Chunks(chunks)
    }

    /// Optional text followed by a finish carrying tool calls.
    pub fn tool_calls(text: &str, calls: Vec<MessageToolCall>) -> Self {
        let mut chunks = Vec::new();
        if !text.is_empty() {
            chunks.push(Ok(StreamChunk::text(text)));
        }
        let mut last = StreamChunk::finished(FinishReason::ToolCalls);
        last.tool_calls = calls;
        chunks.push(Ok(last));
        Self::Chunks(chunks)
    }
}

/// Convenience constructor for a proposed call.
pub fn scripted_call(id: &str, name: &str, arguments: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

type ChunkSender = mpsc::Sender<Result<StreamChunk, ProviderError>>;

pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ProviderRequest>>,
    stalled: Mutex<Vec<ChunkSender>>,
    chunk_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
            chunk_delay: None,
        }
    }

    /// Sleep between chunks, to simulate a slow model.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.turns).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl weft_core::Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        lock(&self.requests).push(request);
        let turn = lock(&self.turns)
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))?;

        let (items, stall) = match turn {
            ScriptedTurn::OpenError(e) => return Err(e),
            ScriptedTurn::Chunks(items) => (items, false),
            ScriptedTurn::Stall(chunks) => (chunks.into_iter().map(Ok).collect(), true),
        };

        let (tx, rx) = mpsc::channel(items.len().max(1));
        if stall {
            lock(&self.stalled).push(tx.clone());
        }
        let delay = self.chunk_delay;
        tokio::spawn(async move {
            for item in items {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
