//! Tool dispatch — LLM-facing names and call normalization.
//!
//! The conversation layer sees tools only through this module: a flat list
//! under globally unique names, and envelopes instead of errors.

pub mod tool_dispatcher;
pub mod tool_names;

pub use tool_dispatcher::{LlmTool, ToolDispatcher, ToolEnvelope};
pub use tool_names::{ToolRef, DEFAULT_PREFIX};
