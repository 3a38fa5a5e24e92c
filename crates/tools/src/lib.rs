//! Tool dispatch and built-in tools for weft.
//!
//! - [`ToolDispatcher`] routes each call to local execution or to the client
//! - [`DelegatedTools`] + [`PendingToolCalls`] implement the client round trip
//! - [`default_registry`] builds the in-process tools enabled in config

pub mod current_time;
pub mod delegated;
pub mod dispatcher;
pub mod http_fetch;

use tracing::warn;
use weft_core::tool::ToolRegistry;

pub use delegated::{DelegatedReply, DelegatedTools, PendingToolCalls};
pub use dispatcher::ToolDispatcher;

/// Create a registry holding the named built-in tools. Unknown names are
/// logged and skipped.
pub fn default_registry(enabled: &[String]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for name in enabled {
        match name.as_str() {
            "current_time" => registry.register(Box::new(current_time::CurrentTimeTool)),
            "http_fetch" => registry.register(Box::new(http_fetch::HttpFetchTool::new())),
            other => warn!(tool = %other, "Unknown built-in tool in config, skipping"),
        }
    }
    registry
}
