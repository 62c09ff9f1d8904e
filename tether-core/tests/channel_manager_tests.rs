// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel Manager Tests
//!
//! Tests for the two long-lived channels:
//! - Authentication, status and online/offline events
//! - Reconnect policy and backoff reset
//! - Fetch routing and anonymous channel rotation
//! - Incoming request queueing and handlers
//! - Logout, expiration and provisioning

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::EventLog;
use parking_lot::Mutex;
use tether_core::network::{
    CallbackHandler, ChannelKind, ChannelManager, ClientAction, Credentials, ExpirationReason,
    FetchOptions, Frame, IncomingRequest, ManagerConfig, ManagerEvent, MockDialer, NetworkError,
    RequestHandler, ResponseFrame, SocketStatus, CONNECTION_INVALIDATED_CODE,
    NORMAL_DISCONNECT_CODE,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn config() -> ManagerConfig {
    let mut config = ManagerConfig::new("wss://chat.example.com", "1.0");
    config.backoff_jitter = Duration::ZERO;
    config
}

fn credentials() -> Credentials {
    Credentials::new("a1b2c3.1", "hunter2")
}

fn manager_with_log() -> (ChannelManager, MockDialer, Arc<EventLog>) {
    let dialer = MockDialer::new();
    let manager = ChannelManager::new(config(), dialer.clone());
    let log = EventLog::new();
    manager.add_event_handler(log.clone());
    (manager, dialer, log)
}

/// Lets every runnable task finish without advancing past pending timers.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Default)]
struct RecordingHandler {
    requests: Mutex<Vec<IncomingRequest>>,
    disconnects: Mutex<usize>,
}

impl RequestHandler for RecordingHandler {
    fn handle_request(&self, request: IncomingRequest) {
        self.requests.lock().push(request);
    }

    fn handle_disconnect(&self) {
        *self.disconnects.lock() += 1;
    }
}

// ============================================================
// Authentication
// ============================================================

/// Test: authenticate opens the channel with basic auth and goes online
#[tokio::test(start_paused = true)]
async fn test_authenticate_opens_channel() {
    let (manager, dialer, log) = manager_with_log();
    assert_eq!(manager.is_online(), None);

    manager.authenticate(credentials()).await.unwrap();
    let server = dialer.accept().await;

    assert_eq!(
        server.request().url,
        "wss://chat.example.com/v1/websocket/?version=1.0"
    );
    assert_eq!(
        server.request().header("Authorization"),
        Some(credentials().basic_auth_header().as_str())
    );
    let status = manager.get_status();
    assert_eq!(status.authenticated.status, SocketStatus::Open);
    assert!(status.authenticated.last_connection_timestamp.is_some());
    assert_eq!(status.unauthenticated.status, SocketStatus::Closed);
    assert_eq!(manager.is_online(), Some(true));

    let events = log.events();
    assert!(matches!(
        events[0],
        ManagerEvent::StatusChange {
            channel: ChannelKind::Authenticated,
            status: SocketStatus::Connecting
        }
    ));
    assert!(matches!(
        events[1],
        ManagerEvent::StatusChange {
            channel: ChannelKind::Authenticated,
            status: SocketStatus::Open
        }
    ));
    assert!(matches!(events[2], ManagerEvent::Online));
}

/// Test: concurrent authenticate calls with the same credentials share one
/// connection
#[tokio::test(start_paused = true)]
async fn test_concurrent_authenticate_joins_attempt() {
    let (manager, dialer, _log) = manager_with_log();

    let (first, second) = tokio::join!(
        manager.authenticate(credentials()),
        manager.authenticate(credentials())
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(dialer.dial_count(), 1);
    let a = manager.get_authenticated_resource().await.unwrap();
    let b = manager.get_authenticated_resource().await.unwrap();
    assert!(a.same_as(&b));
}

/// Test: new credentials replace the open channel
#[tokio::test(start_paused = true)]
async fn test_new_credentials_replace_channel() {
    let (manager, dialer, _log) = manager_with_log();

    manager.authenticate(credentials()).await.unwrap();
    let mut old = dialer.accept().await;

    manager
        .authenticate(Credentials::new("a1b2c3.1", "rotated"))
        .await
        .unwrap();
    let new = dialer.accept().await;

    assert_eq!(
        old.next_close().await.map(|(code, _)| code),
        Some(NORMAL_DISCONNECT_CODE)
    );
    assert_eq!(
        new.request().header("Authorization"),
        Some(Credentials::new("a1b2c3.1", "rotated").basic_auth_header().as_str())
    );
}

/// Test: empty credentials are ignored
#[tokio::test(start_paused = true)]
async fn test_empty_credentials_skip_connect() {
    let (manager, dialer, _log) = manager_with_log();

    manager.authenticate(Credentials::new("", "")).await.unwrap();

    assert_eq!(dialer.dial_count(), 0);
    assert_eq!(
        manager.get_authenticated_resource().await.unwrap_err(),
        NetworkError::MissingCredentials
    );
}

/// Test: rejected credentials emit an auth error and do not retry
#[tokio::test(start_paused = true)]
async fn test_auth_rejection_emits_auth_error() {
    let (manager, dialer, log) = manager_with_log();
    dialer.fail_next(NetworkError::AuthRejected { status: 401 });

    let result = manager.authenticate(credentials()).await;

    assert_eq!(result, Err(NetworkError::AuthRejected { status: 401 }));
    assert_eq!(log.count(|e| matches!(e, ManagerEvent::AuthError)), 1);
    assert_eq!(manager.get_status().authenticated.status, SocketStatus::Closed);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(dialer.dial_count(), 1);
}

// ============================================================
// Reconnect
// ============================================================

/// Test: a transient failure marks the manager offline and retries after
/// the first backoff delay
#[tokio::test(start_paused = true)]
async fn test_transient_failure_schedules_reconnect() {
    let (manager, dialer, log) = manager_with_log();
    dialer.fail_next(NetworkError::ConnectionFailed("refused".into()));

    let started = Instant::now();
    assert!(manager.authenticate(credentials()).await.is_err());
    assert_eq!(manager.is_online(), Some(false));
    assert_eq!(log.count(|e| matches!(e, ManagerEvent::Offline)), 1);

    let _server = dialer.accept().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2));

    settle().await;
    assert_eq!(manager.is_online(), Some(true));
    assert_eq!(dialer.dial_count(), 2);
}

/// Test: after a successful connection the next failure backs off from the
/// first delay again
#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_success() {
    let (manager, dialer, _log) = manager_with_log();
    dialer.fail_next(NetworkError::ConnectionFailed("refused".into()));
    dialer.fail_next(NetworkError::ConnectionFailed("refused".into()));

    let started = Instant::now();
    assert!(manager.authenticate(credentials()).await.is_err());
    let server = dialer.accept().await;
    // 1s then 2s.
    assert!(started.elapsed() >= Duration::from_secs(3));
    settle().await;
    assert_eq!(manager.is_online(), Some(true));

    let dropped_at = Instant::now();
    server.close(1011, "server error");
    let _server = dialer.accept().await;
    let elapsed = dropped_at.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2), "backoff was not reset: {:?}", elapsed);
}

/// Test: a normal disconnect is not retried
#[tokio::test(start_paused = true)]
async fn test_normal_disconnect_not_retried() {
    let (manager, dialer, _log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let server = dialer.accept().await;

    server.close(NORMAL_DISCONNECT_CODE, "bye");
    settle().await;
    assert_eq!(manager.get_status().authenticated.status, SocketStatus::Closed);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(dialer.dial_count(), 1);
}

/// Test: an invalidated connection reports an auth error and is not retried
#[tokio::test(start_paused = true)]
async fn test_invalidated_connection_emits_auth_error() {
    let (manager, dialer, log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let server = dialer.accept().await;

    server.close(CONNECTION_INVALIDATED_CODE, "invalidated");
    settle().await;

    assert_eq!(log.count(|e| matches!(e, ManagerEvent::AuthError)), 1);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(dialer.dial_count(), 1);
}

/// Test: reconnect drops both channels and dials again at once
#[tokio::test(start_paused = true)]
async fn test_reconnect_redials_immediately() {
    let (manager, dialer, _log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let mut first = dialer.accept().await;

    let started = Instant::now();
    manager.reconnect().await.unwrap();
    let _second = dialer.accept().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(first.next_close().await.is_some());
    assert_eq!(manager.get_status().authenticated.status, SocketStatus::Open);
}

/// Test: coming back online connects without waiting for the backoff
#[tokio::test(start_paused = true)]
async fn test_navigator_online_connects_immediately() {
    let (manager, dialer, _log) = manager_with_log();
    dialer.fail_next(NetworkError::ConnectionFailed("offline".into()));
    assert!(manager.authenticate(credentials()).await.is_err());

    let started = Instant::now();
    manager.on_navigator_online().await.unwrap();
    let _server = dialer.accept().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    // The cancelled wait does not produce a second dial.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(dialer.dial_count(), 2);
}

/// Test: going offline probes open channels with the short timeout
#[tokio::test(start_paused = true)]
async fn test_navigator_offline_probes_with_short_timeout() {
    let (manager, dialer, _log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let mut server = dialer.accept().await;

    let started = Instant::now();
    manager.on_navigator_offline();

    let probe = server.next_request().await.unwrap();
    assert_eq!(probe.path, "/v1/keepalive");
    assert!(started.elapsed() < Duration::from_secs(1));

    let (_, reason) = server.next_close().await.unwrap();
    assert_eq!(reason, "No response to keepalive request after 5000ms");
}

// ============================================================
// Fetch
// ============================================================

/// Test: fetch without credentials goes over the anonymous channel
#[tokio::test(start_paused = true)]
async fn test_fetch_uses_unauthenticated_channel() {
    let (manager, dialer, _log) = manager_with_log();

    let fetching = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .fetch(
                    "https://chat.example.com/v1/config?platform=desktop",
                    FetchOptions::new("GET").with_header("Accept", "application/json"),
                )
                .await
        }
    });

    let mut server = dialer.accept().await;
    assert!(server.request().header("Authorization").is_none());
    let request = server.next_request().await.unwrap();
    assert_eq!(request.verb, "GET");
    assert_eq!(request.path, "/v1/config?platform=desktop");
    assert_eq!(request.headers, vec!["Accept:application/json".to_string()]);
    server
        .send_frame(&Frame::Response(ResponseFrame {
            id: request.id,
            status: 200,
            message: "OK".into(),
            body: Some(br#"{"config":[]}"#.to_vec()),
            headers: vec!["Content-Type: application/json".into()],
        }))
        .unwrap();

    let response = fetching.await.unwrap().unwrap();
    assert!(response.ok());
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.text().unwrap(), r#"{"config":[]}"#);
    assert_eq!(manager.get_status().unauthenticated.status, SocketStatus::Open);
    // The anonymous channel does not make the manager online.
    assert_eq!(manager.is_online(), None);
}

/// Test: fetch with the stored credentials goes over the authenticated channel
#[tokio::test(start_paused = true)]
async fn test_fetch_with_credentials_uses_authenticated_channel() {
    let (manager, dialer, _log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let mut authenticated = dialer.accept().await;

    let fetching = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .fetch(
                    "/v1/accounts/whoami",
                    FetchOptions::new("GET")
                        .with_header("Authorization", &credentials().basic_auth_header()),
                )
                .await
        }
    });

    let request = authenticated.next_request().await.unwrap();
    assert_eq!(request.path, "/v1/accounts/whoami");
    authenticated.respond(request.id, 200, "OK").unwrap();

    assert_eq!(fetching.await.unwrap().unwrap().status, 200);
    assert_eq!(dialer.dial_count(), 1);
}

/// Test: concurrent anonymous fetches share one connection
#[tokio::test(start_paused = true)]
async fn test_unauthenticated_connect_is_shared() {
    let (manager, dialer, _log) = manager_with_log();

    let (a, b) = tokio::join!(
        manager.get_unauthenticated_resource(),
        manager.get_unauthenticated_resource()
    );

    assert!(a.unwrap().same_as(&b.unwrap()));
    assert_eq!(dialer.dial_count(), 1);
}

/// Test: a cancelled fetch is aborted
#[tokio::test(start_paused = true)]
async fn test_cancelled_fetch_is_aborted() {
    let (manager, dialer, _log) = manager_with_log();
    let cancel = CancellationToken::new();

    let fetching = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .fetch("/v1/slow", FetchOptions::new("GET").with_cancel(cancel))
                .await
        }
    });
    let mut server = dialer.accept().await;
    server.next_request().await.unwrap();

    cancel.cancel();
    assert_eq!(fetching.await.unwrap(), Err(NetworkError::Aborted));

    let already = CancellationToken::new();
    already.cancel();
    assert_eq!(
        manager
            .fetch("/v1/config", FetchOptions::new("GET").with_cancel(already))
            .await,
        Err(NetworkError::Aborted)
    );
}

/// Test: the anonymous channel is rotated some time after it was used
#[tokio::test(start_paused = true)]
async fn test_unauthenticated_channel_rotates() {
    let dialer = MockDialer::new();
    let mut config = config();
    config.unauthenticated_rotation = Duration::from_secs(30);
    let manager = ChannelManager::new(config, dialer.clone());

    let fetching = tokio::spawn({
        let manager = manager.clone();
        async move { manager.fetch("/v1/config", FetchOptions::new("GET")).await }
    });
    let mut first = dialer.accept().await;
    let request = first.next_request().await.unwrap();
    first.respond(request.id, 200, "OK").unwrap();
    fetching.await.unwrap().unwrap();

    let used_at = Instant::now();
    assert_eq!(
        first.next_close().await,
        Some((NORMAL_DISCONNECT_CODE, "Shutdown".to_string()))
    );
    assert!(used_at.elapsed() >= Duration::from_secs(30));

    let _second = dialer.accept().await;
    assert_eq!(dialer.dial_count(), 2);
}

// ============================================================
// Incoming requests
// ============================================================

/// Test: requests arriving before any handler is registered are queued
/// and flushed on registration
#[tokio::test(start_paused = true)]
async fn test_requests_queued_until_handler_registered() {
    let (manager, dialer, log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let server = dialer.accept().await;

    server.send_request(1, "PUT", "/api/v1/message").unwrap();
    server.send_request(2, "PUT", "/api/v1/message").unwrap();
    settle().await;
    assert_eq!(manager.queued_request_count(), 2);
    assert_eq!(log.count(|e| matches!(e, ManagerEvent::FirstEnvelope { .. })), 1);

    let handler = Arc::new(RecordingHandler::default());
    manager.register_request_handler(handler.clone());

    assert_eq!(manager.queued_request_count(), 0);
    let ids: Vec<u64> = handler.requests.lock().iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec![1, 2]);
}

/// Test: registered handlers see requests and the disconnect
#[tokio::test(start_paused = true)]
async fn test_handler_receives_requests_and_disconnect() {
    let (manager, dialer, _log) = manager_with_log();
    let handler = Arc::new(RecordingHandler::default());
    manager.register_request_handler(handler.clone());
    manager.authenticate(credentials()).await.unwrap();
    let mut server = dialer.accept().await;

    server.send_request(9, "PUT", "/api/v1/queue/empty").unwrap();
    settle().await;
    let request = handler.requests.lock().pop().unwrap();
    request.respond(200, "OK").unwrap();
    assert_eq!(server.next_response().await.unwrap().id, 9);

    server.close(NORMAL_DISCONNECT_CODE, "bye");
    settle().await;
    assert_eq!(*handler.disconnects.lock(), 1);
}

/// Test: unregistered handlers no longer receive requests
#[tokio::test(start_paused = true)]
async fn test_unregistered_handler_stops_receiving() {
    let (manager, dialer, _log) = manager_with_log();
    let handler = Arc::new(RecordingHandler::default());
    let as_dyn: Arc<dyn RequestHandler> = handler.clone();
    manager.register_request_handler(as_dyn.clone());
    manager.unregister_request_handler(&as_dyn);
    manager.authenticate(credentials()).await.unwrap();
    let server = dialer.accept().await;

    server.send_request(1, "PUT", "/api/v1/message").unwrap();
    settle().await;

    assert!(handler.requests.lock().is_empty());
    assert_eq!(manager.queued_request_count(), 1);
}

// ============================================================
// Logout, expiration, provisioning
// ============================================================

/// Test: logout closes the channel, goes offline and forgets credentials
#[tokio::test(start_paused = true)]
async fn test_logout() {
    let (manager, dialer, log) = manager_with_log();
    manager.authenticate(credentials()).await.unwrap();
    let mut server = dialer.accept().await;

    manager.logout();

    assert!(server.next_close().await.is_some());
    assert_eq!(manager.is_online(), Some(false));
    assert_eq!(log.count(|e| matches!(e, ManagerEvent::Offline)), 1);
    assert_eq!(
        manager.get_authenticated_resource().await.unwrap_err(),
        NetworkError::MissingCredentials
    );
}

/// Test: an expired manager refuses every channel
#[tokio::test(start_paused = true)]
async fn test_expiration_disables_manager() {
    let (manager, dialer, _log) = manager_with_log();
    manager.on_expiration(ExpirationReason::Remote);

    assert_eq!(
        manager.authenticate(credentials()).await,
        Err(NetworkError::Expired("remote".into()))
    );
    assert!(matches!(
        manager.get_unauthenticated_resource().await,
        Err(NetworkError::Expired(_))
    ));
    assert_eq!(dialer.dial_count(), 0);
}

/// Test: provisioning channels use their own path and handler
#[tokio::test(start_paused = true)]
async fn test_provisioning_resource() {
    let (manager, dialer, _log) = manager_with_log();
    let handler = Arc::new(RecordingHandler::default());

    let resource = manager
        .get_provisioning_resource(handler.clone())
        .await
        .unwrap();
    let server = dialer.accept().await;

    assert_eq!(
        server.request().url,
        "wss://chat.example.com/v1/websocket/provisioning/?version=1.0"
    );
    assert!(server.request().header("Authorization").is_none());

    server.send_request(1, "PUT", "/v1/address").unwrap();
    settle().await;
    assert_eq!(handler.requests.lock()[0].path(), "/v1/address");

    // Provisioning channels do not touch the managed statuses.
    assert_eq!(manager.get_status().authenticated.status, SocketStatus::Closed);
    assert_eq!(manager.get_status().unauthenticated.status, SocketStatus::Closed);
    resource.close(NORMAL_DISCONNECT_CODE, "done");
}

/// Test: closure-based event handlers receive events
#[tokio::test(start_paused = true)]
async fn test_callback_event_handler() {
    let dialer = MockDialer::new();
    let manager = ChannelManager::new(config(), dialer.clone());
    let online = Arc::new(Mutex::new(0usize));
    let counter = online.clone();
    manager.add_event_handler(Arc::new(CallbackHandler::new(move |event| {
        if matches!(event, ManagerEvent::Online) {
            *counter.lock() += 1;
        }
    })));

    manager.authenticate(credentials()).await.unwrap();

    assert_eq!(*online.lock(), 1);
    let mut server = dialer.accept().await;
    manager.logout();
    assert!(matches!(
        server.next_action().await,
        Some(ClientAction::Close { .. })
    ));
}
