//! Model provider implementations for weft.
//!
//! All providers implement the `weft_core::Provider` trait.
//! The router selects the correct provider based on configuration.

pub mod openai_compat;
pub mod retry;
pub mod router;
pub mod scripted;

pub use openai_compat::{OpenAiCompatProvider, SseTurnParser};
pub use retry::RetryingProvider;
pub use router::{ProviderRouter, build_from_config};
pub use scripted::{ScriptedProvider, ScriptedTurn, scripted_call};
