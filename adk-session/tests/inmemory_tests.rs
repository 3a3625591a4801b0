use adk_session::{
    CreateSessionRequest, Event, GetSessionConfig, GetSessionRequest, InMemorySessionService,
    ListSessionsRequest, SessionError, SessionKey, SessionService,
};
use serde_json::json;
use std::collections::HashMap;

fn create_req(session_id: &str, state: HashMap<String, serde_json::Value>) -> CreateSessionRequest {
    CreateSessionRequest {
        app_name: "test_app".to_string(),
        user_id: "user1".to_string(),
        session_id: Some(session_id.to_string()),
        state,
    }
}

#[tokio::test]
async fn test_create_session() {
    let service = InMemorySessionService::new();

    let session = service.create_session(create_req("session1", HashMap::new())).await.unwrap();
    assert_eq!(session.key.session_id, "session1");
    assert_eq!(session.key.app_name, "test_app");
    assert_eq!(session.key.user_id, "user1");
    assert_eq!(session.version, 1);
}

#[tokio::test]
async fn test_create_twice_conflicts() {
    let service = InMemorySessionService::new();
    service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let err = service.create_session(create_req("session1", HashMap::new())).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyExists));
}

#[tokio::test]
async fn test_get_session() {
    let service = InMemorySessionService::new();
    service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let session = service
        .get_session(GetSessionRequest {
            key: SessionKey::new("test_app", "user1", "session1"),
            config: GetSessionConfig::default(),
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.key.session_id, "session1");
}

#[tokio::test]
async fn test_get_missing_session_returns_none() {
    let service = InMemorySessionService::new();
    let session = service
        .get_session(GetSessionRequest {
            key: SessionKey::new("test_app", "user1", "nope"),
            config: GetSessionConfig::default(),
        })
        .await
        .unwrap();
    assert!(session.is_none());
}

#[tokio::test]
async fn test_state_scoping() {
    let service = InMemorySessionService::new();

    let mut state = HashMap::new();
    state.insert("app:key1".to_string(), json!("app_value"));
    state.insert("user:key2".to_string(), json!("user_value"));
    state.insert("key3".to_string(), json!("session_value"));

    let session = service.create_session(create_req("session1", state)).await.unwrap();

    assert_eq!(session.state.get("app:key1"), Some(&json!("app_value")));
    assert_eq!(session.state.get("user:key2"), Some(&json!("user_value")));
    assert_eq!(session.state.get("key3"), Some(&json!("session_value")));
}

#[tokio::test]
async fn test_app_and_user_state_shared_across_sessions() {
    let service = InMemorySessionService::new();

    let mut state = HashMap::new();
    state.insert("app:theme".to_string(), json!("dark"));
    state.insert("user:locale".to_string(), json!("en"));
    service.create_session(create_req("session1", state)).await.unwrap();

    let other = service.create_session(create_req("session2", HashMap::new())).await.unwrap();
    assert_eq!(other.state.get("app:theme"), Some(&json!("dark")));
    assert_eq!(other.state.get("user:locale"), Some(&json!("en")));
}

#[tokio::test]
async fn test_append_event() {
    let service = InMemorySessionService::new();
    let mut session = service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let event = Event::new("inv1");
    service.append_event(&mut session, event).await.unwrap();

    let fetched = service
        .get_session(GetSessionRequest {
            key: session.key.clone(),
            config: GetSessionConfig::default(),
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(fetched.events.len(), 1);
}

#[tokio::test]
async fn test_append_event_idempotent_on_retry() {
    let service = InMemorySessionService::new();
    let mut session = service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let event = Event::with_id("evt-1", "inv1");
    service.append_event(&mut session, event.clone()).await.unwrap();

    // Re-append the identical event_id; backend's merge_event is a no-op on
    // a duplicate key, so no second row (or error) results.
    let mut session_copy = session.clone();
    service.append_event(&mut session_copy, event).await.unwrap();

    let fetched = service
        .get_session(GetSessionRequest { key: session.key.clone(), config: GetSessionConfig::default() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.events.iter().filter(|e| e.id == "evt-1").count(), 1);
}

#[tokio::test]
async fn test_list_sessions() {
    let service = InMemorySessionService::new();

    service.create_session(create_req("session1", HashMap::new())).await.unwrap();
    service.create_session(create_req("session2", HashMap::new())).await.unwrap();

    let sessions = service
        .list_sessions(ListSessionsRequest {
            app_name: "test_app".to_string(),
            user_id: Some("user1".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn test_delete_session() {
    let service = InMemorySessionService::new();
    service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let key = SessionKey::new("test_app", "user1", "session1");
    service.delete_session(key.clone()).await.unwrap();
    // Idempotent: deleting again does not error.
    service.delete_session(key.clone()).await.unwrap();

    let result = service
        .get_session(GetSessionRequest { key, config: GetSessionConfig::default() })
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_rewind_and_clear_rewind() {
    let service = InMemorySessionService::new();
    let mut session = service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let mut e1 = Event::new("inv1");
    e1.actions.state_delta.insert("k".to_string(), json!(1));
    service.append_event(&mut session, e1.clone()).await.unwrap();

    let mut e2 = Event::new("inv1");
    e2.actions.state_delta.insert("k".to_string(), json!(2));
    service.append_event(&mut session, e2).await.unwrap();

    let mut e3 = Event::new("inv1");
    e3.actions.state_delta.insert("k".to_string(), json!(3));
    service.append_event(&mut session, e3).await.unwrap();

    let rewound = service.rewind_session(session.key.clone(), &e1.id).await.unwrap();
    assert_eq!(rewound.state.get("k"), Some(&json!(1)));
    assert_eq!(rewound.events.len(), 1);

    let cleared = service.clear_rewind(session.key.clone()).await.unwrap();
    assert_eq!(cleared.state.get("k"), Some(&json!(3)));
    assert_eq!(cleared.events.len(), 3);
}

#[tokio::test]
async fn test_rewind_unknown_event_not_found() {
    let service = InMemorySessionService::new();
    let session = service.create_session(create_req("session1", HashMap::new())).await.unwrap();

    let err = service.rewind_session(session.key, "missing-event").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound));
}
