//! # adk-core
//!
//! Core event and error types shared by the ADK-Rust session store
//! (`adk-session`).
//!
//! ## Overview
//!
//! - [`Event`] / [`EventActions`] - the append-only unit the session store
//!   persists. The store treats everything but a handful of control fields
//!   (`id`, `invocation_id`, `author`, `timestamp`, `partial`,
//!   `actions.state_delta`) as an opaque payload it never interprets.
//! - [`AdkError`] / [`Result`] - the workspace-wide error type.
//!
//! This crate intentionally does not define the agent, tool, or model
//! traits the full ADK-Rust runtime builds on, those belong to the
//! orchestrating agent tree, which is out of scope for the session store.

pub mod context;
pub mod error;
pub mod event;
pub mod model;
pub mod types;

pub use context::{ToolConfirmationDecision, ToolConfirmationRequest};
pub use error::{AdkError, Result};
pub use event::{
    Event, EventActions, EventCompaction, KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER,
};
pub use model::{CitationMetadata, CitationSource, FinishReason, LlmResponse, UsageMetadata};
pub use types::{Content, FunctionResponseData, MAX_INLINE_DATA_SIZE, Part};
