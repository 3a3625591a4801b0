//! # adk-session
//!
//! Durable session-and-event store for ADK-Rust agents: an append-only
//! event log, three-scope (`app:`/`user:`/session) derived state, and
//! optimistic-concurrency-controlled writes, behind one
//! [`SessionService`] interface shared by every backend.
//!
//! ## Overview
//!
//! - [`SessionService`] / [`SessionStore`] - the append/read/rewind
//!   protocol, implemented once and shared by every backend.
//! - [`Backend`] - the nine-primitive seam a storage engine implements.
//! - [`InMemoryBackend`] - process-memory backend for tests and local use.
//! - [`EmbeddedBackend`] (feature `sqlite`) - single-process SQLite backend.
//! - [`WarehouseBackend`] (feature `postgres`) - multi-writer Postgres
//!   backend for production traffic.
//! - [`SessionView`] - the merged state + event-log read you get back from
//!   `create_session`/`get_session`/`rewind_session`/`clear_rewind`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use adk_session::{CreateSessionRequest, InMemorySessionService, SessionService};
//! use std::collections::HashMap;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemorySessionService::new();
//! let session = store
//!     .create_session(CreateSessionRequest {
//!         app_name: "my_app".to_string(),
//!         user_id: "user_1".to_string(),
//!         session_id: None,
//!         state: HashMap::new(),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## State prefixes
//!
//! | Prefix | Constant | Scope | Persisted? |
//! |--------|----------|-------|------------|
//! | `app:` | [`KEY_PREFIX_APP`] | shared across all sessions of an app | yes |
//! | `user:` | [`KEY_PREFIX_USER`] | shared across a user's sessions within an app | yes |
//! | `temp:` | [`KEY_PREFIX_TEMP`] | this invocation only | no |
//! | *(none)* | - | this session only | yes |

pub mod backend;
pub mod error;
pub mod event;
pub mod inmemory;
pub mod model;
pub mod replay;
pub mod service;
pub mod session;
pub mod state;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod embedded;

#[cfg(feature = "postgres")]
pub mod warehouse;

pub use backend::{Backend, EventQuery};
pub use error::{Result, SessionError};
pub use event::{Event, EventActions, Events};
pub use inmemory::{InMemoryBackend, InMemorySessionService};
pub use model::{EventRow, SessionKey, SessionRow};
pub use service::{
    CreateSessionRequest, GetSessionConfig, GetSessionRequest, ListSessionsRequest, SessionService,
};
pub use session::{Session, KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER};
pub use session::SessionView;
pub use state::{ReadonlyState, State};
pub use store::SessionStore;

#[cfg(feature = "sqlite")]
pub use embedded::{EmbeddedBackend, EmbeddedConfig};

#[cfg(feature = "postgres")]
pub use warehouse::{WarehouseBackend, WarehouseConfig};
