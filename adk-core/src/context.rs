use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decision applied when a tool execution requires human confirmation.
///
/// Carried on [`crate::EventActions`] as part of the opaque event payload.
/// The session store never branches on this, it is here only so `Event`
/// round-trips through JSON unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolConfirmationDecision {
    Approve,
    Deny,
}

/// Payload describing a tool call awaiting human confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmationRequest {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call_id: Option<String>,
    pub args: Value,
}
