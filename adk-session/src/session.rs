use crate::event::{Event, Events};
use crate::model::SessionKey;
use crate::state::State;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

pub use adk_core::event::{KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER};

/// Read view over one session: merged app/user/session state plus whatever
/// slice of the event log the caller asked for. This is the one concrete
/// type every [`crate::backend::Backend`] produces; there is exactly one
/// session shape in this crate regardless of which adapter built it.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub key: SessionKey,
    pub state: HashMap<String, Value>,
    pub events: Vec<Event>,
    pub last_update_time: DateTime<Utc>,
    pub version: i64,
    pub rewind_to_event_id: Option<String>,
}

pub trait Session: Send + Sync {
    fn id(&self) -> &str;
    fn app_name(&self) -> &str;
    fn user_id(&self) -> &str;
    fn state(&self) -> &dyn State;
    fn events(&self) -> &dyn Events;
    fn last_update_time(&self) -> DateTime<Utc>;
}

impl Session for SessionView {
    fn id(&self) -> &str {
        &self.key.session_id
    }

    fn app_name(&self) -> &str {
        &self.key.app_name
    }

    fn user_id(&self) -> &str {
        &self.key.user_id
    }

    fn state(&self) -> &dyn State {
        self
    }

    fn events(&self) -> &dyn Events {
        self
    }

    fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }
}

impl State for SessionView {
    fn get(&self, key: &str) -> Option<Value> {
        self.state.get(key).cloned()
    }

    fn set(&mut self, key: String, value: Value) {
        self.state.insert(key, value);
    }

    fn all(&self) -> HashMap<String, Value> {
        self.state.clone()
    }
}

impl Events for SessionView {
    fn all(&self) -> Vec<Event> {
        self.events.clone()
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn at(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }
}
