use std::sync::Arc;
use std::time::Duration;

use rr_session::{
    ChannelNotifier, Error, Expiry, FailureKind, KeyValueStore, MemoryStore, Method, SessionConfig,
    SessionEnd, SessionManager, SessionState, TokenSet, UserRecord,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Notifications = UnboundedReceiver<(SessionEnd, String)>;

fn expires_in(ttl: time::Duration) -> String {
    (OffsetDateTime::now_utc() + ttl).format(&Rfc3339).unwrap()
}

fn make_refresh_response(access: &str, refresh: &str, ttl: time::Duration) -> Value {
    json!({
        "success": true,
        "message": "Token refreshed",
        "data": {
            "accessToken": access,
            "refreshToken": refresh,
            "expiresAt": expires_in(ttl)
        }
    })
}

fn make_user() -> UserRecord {
    UserRecord(json!({
        "id": 12,
        "email": "diner@example.com",
        "first_name": "Ada",
        "last_name": "Lovelace",
        "role": "customer"
    }))
}

fn manager_for(
    server: &MockServer,
    config: impl FnOnce(SessionConfig) -> SessionConfig,
) -> (SessionManager, Arc<MemoryStore>, Notifications) {
    let store = Arc::new(MemoryStore::new());
    let (notifier, rx) = ChannelNotifier::new();
    let config = config(SessionConfig::new(server.uri().parse().unwrap()));
    let manager = SessionManager::new(config, store.clone(), Arc::new(notifier));
    (manager, store, rx)
}

fn signed_in(manager: &SessionManager, access: &str, refresh: &str, ttl: time::Duration) {
    manager.set_session(
        TokenSet::new(access, refresh, Expiry::in_duration(ttl)),
        make_user(),
    );
}

async fn next_notification(rx: &mut Notifications) -> (SessionEnd, String) {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("notification within timeout")
        .expect("notifier channel open")
}

#[tokio::test]
async fn test_sign_in_sets_and_persists_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/sign-in"))
        .and(body_json(json!({ "email": "diner@example.com", "password": "secret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "message": "Login successful",
            "data": {
                "user": make_user().as_json(),
                "session": {
                    "id": 3,
                    "accessToken": "access-1",
                    "refreshToken": "refresh-1",
                    "expiresAt": expires_in(time::Duration::hours(1))
                }
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, _rx) = manager_for(&mock_server, |c| c);
    let user = manager.sign_in("diner@example.com", "secret").await.unwrap();

    assert_eq!(user, make_user());
    assert!(manager.is_authenticated());
    assert_eq!(
        manager.auth_headers().get("authorization").unwrap(),
        "Bearer access-1"
    );
    assert_eq!(store.get("access_token").unwrap().as_deref(), Some("access-1"));
    assert_eq!(store.get("refresh_token").unwrap().as_deref(), Some("refresh-1"));
    assert!(store.get("user").unwrap().unwrap().contains("diner@example.com"));
    assert!(store.get("token_expiry").unwrap().is_some());
}

#[tokio::test]
async fn test_sign_in_failure_surfaces_server_message() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/sign-in"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "message": "Incorrect Password"
        })))
        .mount(&mock_server)
        .await;

    let (manager, store, _rx) = manager_for(&mock_server, |c| c);
    let err = manager.sign_in("diner@example.com", "wrong").await.unwrap_err();

    match err {
        Error::Api {
            message, status, ..
        } => {
            assert_eq!(message, "Incorrect Password");
            assert_eq!(status, Some(404));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_refresh_updates_tokens_but_keeps_user() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .and(body_json(json!({ "token": "refresh-old" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(make_refresh_response(
            "access-new",
            "refresh-new",
            time::Duration::hours(1),
        )))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, _rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let tokens = manager.refresh_access_token().await.unwrap();
    assert_eq!(tokens.access_token.as_str(), "access-new");
    assert_eq!(manager.user(), Some(make_user()));
    assert_eq!(manager.state(), SessionState::Authenticated);
    assert_eq!(store.get("access_token").unwrap().as_deref(), Some("access-new"));
    assert_eq!(store.get("refresh_token").unwrap().as_deref(), Some("refresh-new"));
}

#[tokio::test]
async fn test_refresh_failure_leaves_session_untouched() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "message": "Invalid refresh token"
        })))
        .mount(&mock_server)
        .await;

    let (manager, store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let err = manager.refresh_access_token().await.unwrap_err();
    assert!(matches!(err, Error::Api { .. }));
    assert!(manager.is_authenticated());
    assert_eq!(store.get("access_token").unwrap().as_deref(), Some("access-old"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unauthorized_request_refreshes_and_retries_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/reservations"))
        .and(header("authorization", "Bearer access-old"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Token expired"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rr/api/reservations"))
        .and(header("authorization", "Bearer access-new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [{ "id": 1, "party_size": 4 }]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(make_refresh_response(
            "access-new",
            "refresh-new",
            time::Duration::hours(1),
        )))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, _store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let reply = manager
        .perform_request(Method::GET, "/rr/api/reservations", None, true)
        .await;

    assert!(reply.success);
    assert_eq!(reply.data[0]["party_size"], 4);
    assert!(manager.is_authenticated());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unauthorized_retry_rejected_again_signs_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/reservations"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Session is inactive"
        })))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(make_refresh_response(
            "access-new",
            "refresh-new",
            time::Duration::hours(1),
        )))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rr/api/sign-out"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let body = json!({ "restaurant_id": 5, "party_size": 2 });
    let reply = manager
        .perform_request(Method::POST, "/rr/api/reservations", Some(&body), true)
        .await;

    assert!(!reply.success);
    assert!(reply.is_auth_required());
    assert_eq!(reply.message.as_deref(), Some("Authentication required"));
    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
    assert_eq!(
        next_notification(&mut rx).await,
        (SessionEnd::Unauthorized, "/rr/sign-in".to_string())
    );
}

#[tokio::test]
async fn test_unauthorized_with_failed_refresh_does_not_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/reservations"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "message": "Refresh token expired"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rr/api/sign-out"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, _store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let reply = manager
        .perform_request(Method::GET, "/rr/api/reservations", None, true)
        .await;

    assert!(reply.is_auth_required());
    assert!(!manager.is_authenticated());
    assert_eq!(next_notification(&mut rx).await.0, SessionEnd::Unauthorized);
}

#[tokio::test]
async fn test_anonymous_request_ignores_unauthorized() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/restaurants"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Missing or invalid authorization header"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, _store, _rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-1", "refresh-1", time::Duration::hours(1));

    let reply = manager
        .perform_request(Method::GET, "/rr/api/restaurants", None, false)
        .await;

    assert!(!reply.success);
    assert_eq!(reply.status, Some(401));
    assert_eq!(reply.failure, Some(FailureKind::Server));
    assert_eq!(
        reply.message.as_deref(),
        Some("Missing or invalid authorization header")
    );
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_network_failure_becomes_failure_reply() {
    // Grab a free port and release it so nothing is listening there.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = SessionConfig::new(format!("http://127.0.0.1:{port}").parse().unwrap());
    let (notifier, _rx) = ChannelNotifier::new();
    let manager = SessionManager::new(config, Arc::new(MemoryStore::new()), Arc::new(notifier));
    signed_in(&manager, "access-1", "refresh-1", time::Duration::hours(1));

    let reply = manager
        .perform_request(Method::GET, "/rr/api/reservations", None, true)
        .await;

    assert!(!reply.success);
    assert_eq!(reply.failure, Some(FailureKind::Network));
    assert!(reply.message.is_some());
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_scheduled_refresh_fires_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .and(body_json(json!({ "token": "refresh-4" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(make_refresh_response(
            "access-new",
            "refresh-new",
            time::Duration::hours(2),
        )))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, _store, _rx) = manager_for(&mock_server, |c| {
        c.with_refresh_lead(Duration::from_secs(3600))
            .with_min_refresh_delay(Duration::from_millis(50))
    });
    // Each call replaces the previous timer; only the last may fire.
    for i in 0..5 {
        signed_in(
            &manager,
            &format!("access-{i}"),
            &format!("refresh-{i}"),
            time::Duration::minutes(30),
        );
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        manager.auth_headers().get("authorization").unwrap(),
        "Bearer access-new"
    );
    assert_eq!(manager.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_scheduled_refresh_failure_signs_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "message": "Invalid refresh token"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rr/api/sign-out"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, mut rx) = manager_for(&mock_server, |c| {
        c.with_refresh_lead(Duration::from_secs(3600))
            .with_min_refresh_delay(Duration::from_millis(50))
            .with_login_path("/rr/login/")
    });
    signed_in(&manager, "access-1", "refresh-1", time::Duration::minutes(30));

    assert_eq!(
        next_notification(&mut rx).await,
        (SessionEnd::RefreshFailed, "/rr/login/".to_string())
    );
    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_refresh_response_after_clear_is_discarded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(make_refresh_response(
                    "access-new",
                    "refresh-new",
                    time::Duration::hours(1),
                ))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&mock_server)
        .await;

    let (manager, store, _rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let refreshing = manager.clone();
    let in_flight = tokio::spawn(async move { refreshing.refresh_access_token().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.state(), SessionState::Refreshing);
    manager.clear_session();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::SessionChanged)));
    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_validate_session_invalid_clears_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/validate-session"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Session is inactive"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-1", "refresh-1", time::Duration::hours(1));

    assert!(!manager.validate_session().await.unwrap());
    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
    assert_eq!(next_notification(&mut rx).await.0, SessionEnd::Invalidated);
}

#[tokio::test]
async fn test_validate_session_valid_keeps_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/validate-session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "Session is validated"
        })))
        .mount(&mock_server)
        .await;

    let (manager, _store, _rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-1", "refresh-1", time::Duration::hours(1));

    assert!(manager.validate_session().await.unwrap());
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_current_user_replaces_stored_user() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "User retrieved successfully",
            "data": { "id": 12, "email": "new@example.com", "role": "admin" }
        })))
        .mount(&mock_server)
        .await;

    let (manager, store, _rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-1", "refresh-1", time::Duration::hours(1));

    let user = manager.current_user().await.unwrap();
    assert_eq!(
        user.get("email").and_then(Value::as_str),
        Some("new@example.com")
    );
    assert_eq!(manager.user(), Some(user));
    assert!(store.get("user").unwrap().unwrap().contains("new@example.com"));
}

#[tokio::test]
async fn test_sign_out_clears_even_when_server_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/sign-out"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-1", "refresh-1", time::Duration::hours(1));

    manager.sign_out().await;

    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
    assert_eq!(next_notification(&mut rx).await.0, SessionEnd::SignedOut);
}

#[tokio::test]
async fn test_cancelled_refresh_returns_to_authenticated() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(make_refresh_response(
                    "access-new",
                    "refresh-new",
                    time::Duration::hours(1),
                ))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&mock_server)
        .await;

    let (manager, _store, _rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let outcome =
        tokio::time::timeout(Duration::from_millis(100), manager.refresh_access_token()).await;
    assert!(outcome.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.state(), SessionState::Authenticated);
    assert_eq!(
        manager.auth_headers().get("authorization").unwrap(),
        "Bearer access-old"
    );
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/reservations"))
        .and(header("authorization", "Bearer access-old"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rr/api/reservations"))
        .and(header("authorization", "Bearer access-new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": []
        })))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(make_refresh_response(
                    "access-new",
                    "refresh-new",
                    time::Duration::hours(1),
                ))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, _store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let (first, second) = tokio::join!(
        manager.perform_request(Method::GET, "/rr/api/reservations", None, true),
        manager.perform_request(Method::GET, "/rr/api/reservations", None, true),
    );

    assert!(first.success);
    assert!(second.success);
    assert!(manager.is_authenticated());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_unauthorized_with_rejected_refresh_ends_session_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rr/api/reservations"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rr/api/refresh-token"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({
                    "success": false,
                    "message": "Refresh token expired"
                }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    // Slow sign-out keeps the session alive while the second caller takes its turn.
    Mock::given(method("GET"))
        .and(path("/rr/api/sign-out"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, store, mut rx) = manager_for(&mock_server, |c| c);
    signed_in(&manager, "access-old", "refresh-old", time::Duration::hours(1));

    let (first, second) = tokio::join!(
        manager.perform_request(Method::GET, "/rr/api/reservations", None, true),
        manager.perform_request(Method::GET, "/rr/api/reservations", None, true),
    );

    assert!(first.is_auth_required());
    assert!(second.is_auth_required());
    assert!(!manager.is_authenticated());
    assert!(store.is_empty());
    assert_eq!(next_notification(&mut rx).await.0, SessionEnd::Unauthorized);
    assert!(rx.try_recv().is_err());
}
