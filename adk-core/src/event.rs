use crate::context::{ToolConfirmationDecision, ToolConfirmationRequest};
use crate::model::LlmResponse;
use crate::types::Content;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// State scope prefixes.
pub const KEY_PREFIX_APP: &str = "app:";
pub const KEY_PREFIX_TEMP: &str = "temp:";
pub const KEY_PREFIX_USER: &str = "user:";

/// A single interaction in a conversation. This is the unit the session
/// store appends, persists, and replays. The store reads only `id`,
/// `invocation_id`, `author`, `timestamp`, `llm_response.partial`, and
/// `actions.state_delta`; everything else is opaque payload it serializes
/// and hands back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub invocation_id: String,
    pub branch: String,
    pub author: String,
    /// The model turn this event carries. Access content via
    /// `event.llm_response.content`.
    #[serde(flatten)]
    pub llm_response: LlmResponse,
    pub actions: EventActions,
    /// IDs of long-running tools associated with this event.
    #[serde(default)]
    pub long_running_tool_ids: Vec<String>,
    /// LLM request data for UI display (JSON string).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_request: Option<String>,
    /// Provider-specific metadata (e.g. GCP Vertex, Azure OpenAI). Keeps
    /// the core `Event` struct provider-agnostic.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provider_metadata: HashMap<String, String>,
    /// Opaque reference to payload offloaded to external blob storage
    /// (e.g. a large tool result). The session store never resolves or
    /// interprets this; it only carries it through as part of the event's
    /// serialized payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
}

/// Metadata for a compacted (summarized) event. When context compaction is
/// enabled upstream, older events are summarized into a single compacted
/// event carrying this metadata. The session store has no opinion on
/// compaction; it is named here only because it's part of `Event`'s wire
/// shape and the store never interprets event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCompaction {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub compacted_content: Content,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventActions {
    /// Flat mapping of keys to new values or the `null` sentinel denoting
    /// removal. Applied by the state projector in `adk_session::state`.
    pub state_delta: HashMap<String, serde_json::Value>,
    pub artifact_delta: HashMap<String, i64>,
    pub skip_summarization: bool,
    pub transfer_to_agent: Option<String>,
    pub escalate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_confirmation: Option<ToolConfirmationRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_confirmation_decision: Option<ToolConfirmationDecision>,
    /// Present when this event is a compaction summary replacing older
    /// events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<EventCompaction>,
}

impl Event {
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            invocation_id: invocation_id.into(),
            branch: String::new(),
            author: String::new(),
            llm_response: LlmResponse::default(),
            actions: EventActions::default(),
            long_running_tool_ids: Vec::new(),
            llm_request: None,
            provider_metadata: HashMap::new(),
            blob_ref: None,
        }
    }

    /// Create an event with a specific ID.
    ///
    /// Use this for streaming events where all chunks should share the
    /// same `event_id`. The session store skips partial events entirely,
    /// but non-agent callers that synthesize a final event from streamed
    /// chunks want it to carry the same ID the chunks did.
    pub fn with_id(id: impl Into<String>, invocation_id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::new(invocation_id) }
    }

    /// Convenience method to access content directly.
    pub fn content(&self) -> Option<&Content> {
        self.llm_response.content.as_ref()
    }

    /// Convenience method to set content directly.
    pub fn set_content(&mut self, content: Content) {
        self.llm_response.content = Some(content);
    }

    /// Whether this event is a streaming fragment. Partial events are
    /// never persisted by the session store.
    pub fn is_partial(&self) -> bool {
        self.llm_response.partial
    }
}
