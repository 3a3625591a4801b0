//! Rebuilds session-scope state from an event log; the mechanism behind
//! rewind and clear-rewind. Pure function: no I/O, no backend knowledge,
//! so every [`crate::backend::Backend`] gets identical rewind semantics
//! for free.

use crate::model::EventRow;
use crate::state::apply_delta;
use serde_json::Value;
use std::collections::HashMap;

/// Replay `rows` (already in canonical `(sequence_num, created_time,
/// event_id)` order) from scratch, folding in each event's session-scope
/// state delta. `cutoff_sequence_num`, when set, drops events strictly
/// after it; this is how `rewind_session` reconstructs state as of an
/// earlier point without touching the event rows at all. Malformed
/// `state_delta_json` is logged and skipped rather than aborting the whole
/// replay, matching the degrade-gracefully posture the embedded backend
/// takes on state corruption.
pub fn rebuild(rows: &[EventRow], cutoff_sequence_num: Option<i64>) -> HashMap<String, Value> {
    let mut state = HashMap::new();

    for row in rows {
        if let Some(cutoff) = cutoff_sequence_num {
            if row.sequence_num > cutoff {
                continue;
            }
        }
        if !row.has_state_delta {
            continue;
        }
        let Some(delta_json) = row.state_delta_json.as_deref() else {
            continue;
        };
        match serde_json::from_str::<HashMap<String, Value>>(delta_json) {
            Ok(delta) => {
                let (_, _, session_delta) = crate::state::split_delta(&delta);
                state = apply_delta(&state, &session_delta);
            }
            Err(err) => {
                tracing::warn!(
                    event_id = %row.event_id,
                    error = %err,
                    "skipping unreadable state_delta_json during replay"
                );
            }
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn row(event_id: &str, sequence_num: i64, delta: Option<Value>) -> EventRow {
        let now = Utc::now();
        EventRow {
            app_name: "app".to_string(),
            user_id: "user".to_string(),
            session_id: "sess".to_string(),
            event_id: event_id.to_string(),
            sequence_num,
            event_timestamp: now,
            created_time: now,
            invocation_id: "inv".to_string(),
            author: "agent".to_string(),
            event_data_json: "{}".to_string(),
            has_state_delta: delta.is_some(),
            state_delta_json: delta.map(|d| d.to_string()),
            is_after_rewind: false,
        }
    }

    #[test]
    fn test_rebuild_applies_deltas_in_order() {
        let rows = vec![
            row("e1", 1000, Some(json!({"counter": 1}))),
            row("e2", 1001, Some(json!({"counter": 2, "name": "bob"}))),
        ];
        let state = rebuild(&rows, None);
        assert_eq!(state.get("counter"), Some(&json!(2)));
        assert_eq!(state.get("name"), Some(&json!("bob")));
    }

    #[test]
    fn test_rebuild_respects_cutoff() {
        let rows = vec![
            row("e1", 1000, Some(json!({"counter": 1}))),
            row("e2", 2000, Some(json!({"counter": 2}))),
        ];
        let state = rebuild(&rows, Some(1000));
        assert_eq!(state.get("counter"), Some(&json!(1)));
    }

    #[test]
    fn test_rebuild_deletes_on_null() {
        let rows = vec![
            row("e1", 1000, Some(json!({"a": 1, "b": 2}))),
            row("e2", 1001, Some(json!({"a": Value::Null}))),
        ];
        let state = rebuild(&rows, None);
        assert!(!state.contains_key("a"));
        assert_eq!(state.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_rebuild_skips_malformed_delta() {
        let mut bad = row("e1", 1000, Some(json!({"a": 1})));
        bad.state_delta_json = Some("not json".to_string());
        let rows = vec![bad, row("e2", 1001, Some(json!({"b": 2})))];
        let state = rebuild(&rows, None);
        assert!(!state.contains_key("a"));
        assert_eq!(state.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_rebuild_skips_rows_without_delta() {
        let rows = vec![row("e1", 1000, None)];
        let state = rebuild(&rows, None);
        assert!(state.is_empty());
    }
}
