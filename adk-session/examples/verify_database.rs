//! Inspect a database written by `database_example`. Run with:
//! `cargo run -p adk-session --example verify_database --features sqlite`

use adk_session::{EmbeddedBackend, EmbeddedConfig, ListSessionsRequest, SessionService, SessionStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying existing database...\n");

    let backend = EmbeddedBackend::new(EmbeddedConfig::file("test_adk.db")).await?;
    let store = SessionStore::new(backend);

    let sessions = store
        .list_sessions(ListSessionsRequest {
            app_name: "test_app".to_string(),
            user_id: Some("user1".to_string()),
        })
        .await?;

    println!("Found {} session(s) in database:", sessions.len());
    for session in sessions {
        println!("   - Session ID: {}", session.key.session_id);
        println!("     App: {}", session.key.app_name);
        println!("     User: {}", session.key.user_id);
        println!("     Events: {}", session.events.len());
        println!("     State keys: {}", session.state.len());
    }

    println!("\nDatabase verification complete!");
    Ok(())
}
