//! The agentic orchestration loop for weft.
//!
//! A generation runs as a sequence of turns:
//!
//! 1. **Stream** a model turn, forwarding text to the job and the buffer
//! 2. **Suspend** if the turn announces a plan, until a human decides
//! 3. **Dispatch** proposed tool calls concurrently and fold results back
//! 4. **Finish** when a turn proposes no calls, or on error or cancellation
//!
//! The loop talks to the outside world only through the [`RunContext`]:
//! a tool dispatcher, a [`PersistenceBuffer`], an event channel and a
//! cancellation token.

pub mod approval;
pub mod loop_runner;
pub mod persistence;
pub mod plan;

pub use approval::{ApprovalDecision, ApprovalRegistry, DEFAULT_APPROVAL_TEXT};
pub use loop_runner::{AgentLoop, LoopOutcome, LoopSettings, RunContext};
pub use persistence::{PersistenceBuffer, ResponseDraft};
pub use plan::{PlanDetector, SentinelDetector};
