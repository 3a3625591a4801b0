//! Pure state-projection helpers shared by every [`crate::backend::Backend`]
//! and by [`crate::store::SessionStore`] itself. None of these touch I/O;
//! they operate on plain `HashMap<String, Value>` deltas so the same logic
//! runs identically against the in-memory, embedded, and warehouse
//! backends.

use adk_core::event::{KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER};
use serde_json::Value;
use std::collections::HashMap;

pub trait State: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: String, value: Value);
    fn all(&self) -> HashMap<String, Value>;
}

pub trait ReadonlyState: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn all(&self) -> HashMap<String, Value>;
}

/// Split a raw event delta into its three scope buckets. `temp:` entries are
/// dropped entirely: they exist only within a single invocation and are
/// never persisted. Prefixes are stripped from the app/user buckets' keys;
/// the session bucket keeps whatever key it was given (plain keys live in
/// session scope).
pub fn split_delta(
    delta: &HashMap<String, Value>,
) -> (HashMap<String, Value>, HashMap<String, Value>, HashMap<String, Value>) {
    let mut app = HashMap::new();
    let mut user = HashMap::new();
    let mut session = HashMap::new();

    for (key, value) in delta {
        if let Some(rest) = key.strip_prefix(KEY_PREFIX_APP) {
            app.insert(rest.to_string(), value.clone());
        } else if let Some(rest) = key.strip_prefix(KEY_PREFIX_USER) {
            user.insert(rest.to_string(), value.clone());
        } else if key.starts_with(KEY_PREFIX_TEMP) {
            continue;
        } else {
            session.insert(key.clone(), value.clone());
        }
    }

    (app, user, session)
}

/// Apply a delta to a state map in place semantics: `Value::Null` deletes
/// the key, anything else overwrites it. Returns a new map; `current` is
/// left untouched.
pub fn apply_delta(
    current: &HashMap<String, Value>,
    delta: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut next = current.clone();
    for (key, value) in delta {
        if value.is_null() {
            next.remove(key);
        } else {
            next.insert(key.clone(), value.clone());
        }
    }
    next
}

/// Merge the three scopes into the flat, prefixed view handed to callers via
/// [`crate::session::Session::state`]. Collisions cannot occur since the
/// scopes write to disjoint prefixes.
pub fn merge_states(
    app_state: &HashMap<String, Value>,
    user_state: &HashMap<String, Value>,
    session_state: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut merged = HashMap::with_capacity(app_state.len() + user_state.len() + session_state.len());
    for (key, value) in app_state {
        merged.insert(format!("{KEY_PREFIX_APP}{key}"), value.clone());
    }
    for (key, value) in user_state {
        merged.insert(format!("{KEY_PREFIX_USER}{key}"), value.clone());
    }
    for (key, value) in session_state {
        merged.insert(key.clone(), value.clone());
    }
    merged
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::collection::hash_map;
    use proptest::prelude::*;

    fn key_strategy() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    fn scalar_value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(|s| json!(s)),
        ]
    }

    proptest! {
        /// `apply_delta` removes exactly the null-valued keys, overwrites
        /// the rest, and never touches a key absent from the delta.
        #[test]
        fn apply_delta_matches_null_sentinel_semantics(
            current in hash_map(key_strategy(), any::<i64>().prop_map(|n| json!(n)), 0..8),
            delta in hash_map(key_strategy(), scalar_value_strategy(), 0..8),
        ) {
            let next = apply_delta(&current, &delta);

            for (key, value) in &delta {
                if value.is_null() {
                    prop_assert!(!next.contains_key(key));
                } else {
                    prop_assert_eq!(next.get(key), Some(value));
                }
            }
            for (key, value) in &current {
                if !delta.contains_key(key) {
                    prop_assert_eq!(next.get(key), Some(value));
                }
            }
        }

        /// `current` is never mutated by `apply_delta` (deep-copy safe).
        #[test]
        fn apply_delta_does_not_mutate_current(
            current in hash_map(key_strategy(), any::<i64>().prop_map(|n| json!(n)), 0..8),
            delta in hash_map(key_strategy(), scalar_value_strategy(), 0..8),
        ) {
            let before = current.clone();
            let _ = apply_delta(&current, &delta);
            prop_assert_eq!(current, before);
        }

        /// `split_delta` never lets a `temp:`-prefixed key survive into
        /// either the app, user, or session bucket.
        #[test]
        fn split_delta_drops_temp_namespace(
            delta in hash_map(key_strategy().prop_map(|k| format!("temp:{k}")), scalar_value_strategy(), 0..8),
        ) {
            let (app, user, session) = split_delta(&delta);
            prop_assert!(app.is_empty());
            prop_assert!(user.is_empty());
            prop_assert!(session.is_empty());
        }
    }
}
