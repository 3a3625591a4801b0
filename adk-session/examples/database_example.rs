//! Create a SQLite-backed session store on disk, append an event, and read
//! it back. Run with: `cargo run -p adk-session --example database_example --features sqlite`

use adk_session::{
    CreateSessionRequest, EmbeddedBackend, EmbeddedConfig, Event, GetSessionConfig,
    GetSessionRequest, ListSessionsRequest, SessionKey, SessionService, SessionStore,
};
use std::collections::HashMap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = "test_adk.db";
    println!("Creating SQLite database at {db_path}");

    let backend = EmbeddedBackend::new(EmbeddedConfig::file(db_path)).await?;
    let store = SessionStore::new(backend);

    let session = store
        .create_session(CreateSessionRequest {
            app_name: "test_app".to_string(),
            user_id: "user1".to_string(),
            session_id: Some("session1".to_string()),
            state: HashMap::new(),
        })
        .await?;

    println!("Created session: {}", session.key.session_id);
    println!("   App: {}", session.key.app_name);
    println!("   User: {}", session.key.user_id);

    let retrieved = store
        .get_session(GetSessionRequest {
            key: SessionKey::new("test_app", "user1", "session1"),
            config: GetSessionConfig::default(),
        })
        .await?
        .expect("session was just created");
    println!("Retrieved session: {}", retrieved.key.session_id);

    let mut event = Event::new("inv-1");
    event.actions.state_delta.insert("greeting".to_string(), serde_json::json!("hello"));
    let mut live = retrieved;
    store.append_event(&mut live, event).await?;
    println!("Appended event, session now at version {}", live.version);

    let sessions = store
        .list_sessions(ListSessionsRequest {
            app_name: "test_app".to_string(),
            user_id: Some("user1".to_string()),
        })
        .await?;
    println!("Found {} session(s)", sessions.len());
    println!("Database file created at: {db_path}");
    println!("   You can inspect it with: sqlite3 {db_path}");

    Ok(())
}
