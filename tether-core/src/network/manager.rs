// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel Manager
//!
//! Owns up to two long-lived channels to the service: one authenticated with
//! the account credentials, one anonymous. Handles reconnection with
//! backoff, online/offline tracking, incoming request routing, and an
//! HTTP-like `fetch` on top of whichever channel fits the request.
//!
//! # Example
//!
//! ```ignore
//! use tether_core::network::{ChannelManager, Credentials, FetchOptions, ManagerConfig};
//!
//! let manager = ChannelManager::new(
//!     ManagerConfig::new("wss://chat.example.com", "1.0.0"),
//!     WebSocketDialer::new(),
//! );
//! manager.authenticate(Credentials::new("user.1", "secret")).await?;
//! let response = manager.fetch("/v1/config", FetchOptions::default()).await?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{BackOff, DEFAULT_JITTER, EXTENDED_FIBONACCI_TIMEOUTS, FIBONACCI_TIMEOUTS};
use super::credentials::Credentials;
use super::error::{NetworkError, NetworkResult};
use super::events::{ChannelKind, EventDispatcher, EventHandler, ManagerEvent};
use super::fetch::{request_path, FetchOptions, FetchResponse};
use super::keepalive::KeepAliveConfig;
use super::process::ConnectProcess;
use super::resource::{
    IncomingRequest, IncomingRequestHandler, Resource, ResourceConfig, SendRequestOptions,
    ServerRequestType,
};
use super::transport::{
    ConnectRequest, Dialer, ProxyConfig, SocketInfo, SocketStatus, CONNECTED_ELSEWHERE_CODE,
    CONNECTION_INVALIDATED_CODE, NORMAL_DISCONNECT_CODE,
};

/// Lifetime of the anonymous channel after its first fetch.
pub const UNAUTHENTICATED_ROTATION: Duration = Duration::from_secs(5 * 60);

/// Keepalive response timeout used by `check` while the host is offline.
pub const OFFLINE_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives incoming requests from the authenticated channel.
///
/// Handlers are called synchronously and must not panic; release builds
/// abort on panic.
pub trait RequestHandler: Send + Sync {
    /// Called for every incoming request. Must not block.
    fn handle_request(&self, request: IncomingRequest);

    /// Called when the authenticated channel goes away.
    fn handle_disconnect(&self) {}
}

/// Why the manager was permanently shut off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationReason {
    /// The server reported this client as too old.
    Remote,
    /// The local build expired.
    Build,
}

impl fmt::Display for ExpirationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpirationReason::Remote => write!(f, "remote"),
            ExpirationReason::Build => write!(f, "build"),
        }
    }
}

/// Status of both channels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SocketStatuses {
    /// Authenticated channel.
    pub authenticated: SocketInfo,
    /// Anonymous channel.
    pub unauthenticated: SocketInfo,
}

/// Channel manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Service base URL (`wss://host`).
    pub base_url: String,
    /// Client version, sent as a query parameter.
    pub version: String,
    /// Proxy for every channel.
    pub proxy: ProxyConfig,
    /// Additional trusted root certificate (PEM).
    pub certificate_authority: Option<String>,
    /// Deadline for opening a channel.
    pub connect_timeout: Duration,
    /// Default response deadline for fetches without their own.
    pub request_timeout: Option<Duration>,
    /// Path of both regular channels.
    pub websocket_path: String,
    /// Path of provisioning channels.
    pub provisioning_path: String,
    /// Keepalive probe path on regular channels.
    pub keepalive_path: String,
    /// Keepalive probe path on provisioning channels.
    pub provisioning_keepalive_path: String,
    /// Lifetime of the anonymous channel once a fetch used it.
    pub unauthenticated_rotation: Duration,
    /// Upper bound of the random jitter added to reconnect delays.
    pub backoff_jitter: Duration,
    /// Keepalive response deadline used by `check` while offline.
    pub offline_keepalive_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            base_url: String::new(),
            version: String::new(),
            proxy: ProxyConfig::None,
            certificate_authority: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
            websocket_path: "/v1/websocket/".to_string(),
            provisioning_path: "/v1/websocket/provisioning/".to_string(),
            keepalive_path: "/v1/keepalive".to_string(),
            provisioning_keepalive_path: "/v1/keepalive/provisioning".to_string(),
            unauthenticated_rotation: UNAUTHENTICATED_ROTATION,
            backoff_jitter: DEFAULT_JITTER,
            offline_keepalive_timeout: OFFLINE_KEEPALIVE_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    /// Defaults for `base_url` and client `version`.
    pub fn new(base_url: &str, version: &str) -> Self {
        ManagerConfig {
            base_url: base_url.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    fn channel_url(&self, path: &str) -> NetworkResult<String> {
        let mut url = url::Url::parse(&self.base_url)?.join(path)?;
        if !self.version.is_empty() {
            url.query_pairs_mut().append_pair("version", &self.version);
        }
        Ok(url.into())
    }
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Authenticated,
    Unauthenticated,
    Provisioning,
}

impl Channel {
    fn name(self) -> &'static str {
        match self {
            Channel::Authenticated => "authenticated",
            Channel::Unauthenticated => "unauthenticated",
            Channel::Provisioning => "provisioning",
        }
    }
}

enum Effect {
    Emit(ManagerEvent),
    Deliver {
        handlers: Vec<Arc<dyn RequestHandler>>,
        request: IncomingRequest,
    },
    Disconnect(Vec<Arc<dyn RequestHandler>>),
    Abort(ConnectProcess),
}

type Effects = Vec<Effect>;

struct State {
    backoff: BackOff,
    credentials: Option<Credentials>,
    authenticated: Option<ConnectProcess>,
    unauthenticated: Option<ConnectProcess>,
    unauthenticated_rotation: Option<JoinHandle<()>>,
    statuses: SocketStatuses,
    handlers: Vec<Arc<dyn RequestHandler>>,
    queue: VecDeque<IncomingRequest>,
    navigator_offline: bool,
    online: Option<bool>,
    expired: Option<ExpirationReason>,
    reconnect: Option<CancellationToken>,
    envelope_count: u64,
}

impl State {
    fn is_authenticated_process(&self, process: &ConnectProcess) -> bool {
        self.authenticated.as_ref().is_some_and(|p| p.is(process))
    }

    fn is_unauthenticated_process(&self, process: &ConnectProcess) -> bool {
        self.unauthenticated.as_ref().is_some_and(|p| p.is(process))
    }

    fn set_status(&mut self, channel: ChannelKind, status: SocketStatus, fx: &mut Effects) {
        let info = match channel {
            ChannelKind::Authenticated => &mut self.statuses.authenticated,
            ChannelKind::Unauthenticated => &mut self.statuses.unauthenticated,
        };
        if info.status == status {
            return;
        }
        info.status = status;
        if status == SocketStatus::Open {
            info.last_connection_timestamp = Some(SystemTime::now());
        }
        fx.push(Effect::Emit(ManagerEvent::StatusChange { channel, status }));

        if channel == ChannelKind::Authenticated && status == SocketStatus::Open {
            self.mark_online(fx);
        }
    }

    fn mark_online(&mut self, fx: &mut Effects) {
        if self.online != Some(true) {
            self.online = Some(true);
            fx.push(Effect::Emit(ManagerEvent::Online));
        }
    }

    fn mark_offline(&mut self, fx: &mut Effects) {
        if self.online != Some(false) {
            self.online = Some(false);
            fx.push(Effect::Emit(ManagerEvent::Offline));
        }
    }

    fn drop_authenticated(&mut self, process: &ConnectProcess, fx: &mut Effects) {
        if !self.is_authenticated_process(process) {
            return;
        }
        self.queue.clear();
        self.authenticated = None;
        self.set_status(ChannelKind::Authenticated, SocketStatus::Closed, fx);
        fx.push(Effect::Disconnect(self.handlers.clone()));
    }

    fn drop_unauthenticated(&mut self, process: &ConnectProcess, fx: &mut Effects) {
        if !self.is_unauthenticated_process(process) {
            return;
        }
        self.unauthenticated = None;
        if let Some(rotation) = self.unauthenticated_rotation.take() {
            rotation.abort();
        }
        self.set_status(ChannelKind::Unauthenticated, SocketStatus::Closed, fx);
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }
}

struct Inner {
    config: ManagerConfig,
    dialer: Arc<dyn Dialer>,
    state: Mutex<State>,
    events: Mutex<EventDispatcher>,
    process_ids: AtomicU64,
}

/// Manager of the authenticated and anonymous channels.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

enum AuthStart {
    Expired(ExpirationReason),
    Skip,
    Join(ConnectProcess),
    Started(ConnectProcess),
}

impl ChannelManager {
    /// Creates a manager. Nothing connects until the first call that needs
    /// a channel.
    pub fn new(config: ManagerConfig, dialer: impl Dialer + 'static) -> Self {
        let backoff = BackOff::new(FIBONACCI_TIMEOUTS, config.backoff_jitter);
        ChannelManager {
            inner: Arc::new(Inner {
                config,
                dialer: Arc::new(dialer),
                state: Mutex::new(State {
                    backoff,
                    credentials: None,
                    authenticated: None,
                    unauthenticated: None,
                    unauthenticated_rotation: None,
                    statuses: SocketStatuses::default(),
                    handlers: Vec::new(),
                    queue: VecDeque::new(),
                    navigator_offline: false,
                    online: None,
                    expired: None,
                    reconnect: None,
                    envelope_count: 0,
                }),
                events: Mutex::new(EventDispatcher::new()),
                process_ids: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes to manager events.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.events.lock().add_handler(handler);
    }

    /// Status of both channels.
    pub fn get_status(&self) -> SocketStatuses {
        self.inner.state.lock().statuses.clone()
    }

    /// Online state; `None` until the first transition.
    pub fn is_online(&self) -> Option<bool> {
        self.inner.state.lock().online
    }

    /// Incoming requests waiting for a handler.
    pub fn queued_request_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Opens the authenticated channel with `credentials`.
    ///
    /// Cancels any pending reconnect wait. Identical credentials with a
    /// channel already open or connecting join that attempt. Failures are
    /// returned and also drive the reconnect policy: auth rejection emits
    /// [`ManagerEvent::AuthError`], transient failures mark the manager
    /// offline and schedule a retry.
    pub async fn authenticate(&self, credentials: Credentials) -> NetworkResult<()> {
        self.inner.state.lock().cancel_reconnect();
        self.connect_authenticated(credentials).await
    }

    /// The authenticated channel, connecting with the stored credentials if
    /// needed.
    pub async fn get_authenticated_resource(&self) -> NetworkResult<Resource> {
        let (process, credentials) = self.snapshot_authenticated();
        let process = match process {
            Some(process) => process,
            None => {
                let credentials = credentials.ok_or(NetworkError::MissingCredentials)?;
                self.connect_authenticated(credentials).await?;
                let (process, _) = self.snapshot_authenticated();
                process.ok_or(NetworkError::NotConnected)?
            }
        };
        process.result().await
    }

    /// The anonymous channel, connecting if needed. Concurrent callers share
    /// one connection attempt.
    pub async fn get_unauthenticated_resource(&self) -> NetworkResult<Resource> {
        let (process, started) = self.update(|state, fx| {
            if let Some(reason) = state.expired {
                return Err(NetworkError::Expired(reason.to_string()));
            }
            if let Some(process) = &state.unauthenticated {
                return Ok((process.clone(), false));
            }
            state.set_status(ChannelKind::Unauthenticated, SocketStatus::Connecting, fx);
            let process = self.connect_resource(Channel::Unauthenticated, None, None);
            state.unauthenticated = Some(process.clone());
            Ok((process, true))
        })?;

        let result = process.result().await;
        if !started {
            return result;
        }

        match &result {
            Ok(resource) => {
                self.update(|state, fx| {
                    if state.is_unauthenticated_process(&process) {
                        state.set_status(ChannelKind::Unauthenticated, SocketStatus::Open, fx);
                    }
                });
                self.watch_unauthenticated(process, resource.clone());
            }
            Err(err) => {
                warn!(%err, "Unauthenticated connection failed");
                self.update(|state, fx| state.drop_unauthenticated(&process, fx));
            }
        }
        result
    }

    /// Sends an HTTP-like request over the matching channel.
    ///
    /// Requests carrying an `Authorization` header equal to the stored
    /// credentials use the authenticated channel; everything else goes over
    /// the anonymous one.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> NetworkResult<FetchResponse> {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(NetworkError::Aborted);
        }
        let path = request_path(url)?;

        let resource = if self.is_authenticated(&options.headers) {
            self.get_authenticated_resource().await?
        } else {
            let resource = self.get_unauthenticated_resource().await?;
            self.start_unauthenticated_rotation(&resource);
            resource
        };

        let request = SendRequestOptions {
            verb: options.method.clone(),
            path,
            body: options.body.clone(),
            headers: options
                .headers
                .iter()
                .map(|(name, value)| format!("{}:{}", name, value))
                .collect(),
            timeout: options.timeout,
        };

        let sending = resource.send_request(request);
        let response = match &options.cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => return Err(NetworkError::Aborted),
                response = sending => response?,
            },
            None => sending.await?,
        };
        FetchResponse::from_resource_response(response)
    }

    /// Drops both channels and re-authenticates with the stored credentials.
    pub async fn reconnect(&self) -> NetworkResult<()> {
        info!("Reconnecting");
        let credentials = self.update(|state, fx| {
            if let Some(process) = state.authenticated.clone() {
                fx.push(Effect::Abort(process.clone()));
                state.drop_authenticated(&process, fx);
            }
            if let Some(process) = state.unauthenticated.clone() {
                fx.push(Effect::Abort(process.clone()));
                state.drop_unauthenticated(&process, fx);
            }
            state.backoff.reset(None);
            state.cancel_reconnect();
            state.credentials.clone()
        });
        match credentials {
            Some(credentials) => self.connect_authenticated(credentials).await,
            None => Ok(()),
        }
    }

    /// Probes every open channel now. While the host reports no network the
    /// probe uses the short offline timeout.
    pub fn check(&self) {
        let (resources, offline) = {
            let state = self.inner.state.lock();
            let resources: Vec<Resource> = [&state.authenticated, &state.unauthenticated]
                .into_iter()
                .flatten()
                .filter_map(ConnectProcess::peek)
                .collect();
            (resources, state.navigator_offline)
        };
        let timeout = offline.then_some(self.inner.config.offline_keepalive_timeout);
        for resource in resources {
            resource.force_keep_alive(timeout);
        }
    }

    /// The host regained network: restart the short schedule and connect
    /// right away.
    pub async fn on_navigator_online(&self) -> NetworkResult<()> {
        info!("Navigator online");
        let credentials = self.update(|state, _| {
            state.navigator_offline = false;
            state.backoff.reset(Some(FIBONACCI_TIMEOUTS));
            state.cancel_reconnect();
            state.credentials.clone()
        });
        match credentials {
            Some(credentials) => self.connect_authenticated(credentials).await,
            None => Ok(()),
        }
    }

    /// The host lost network: switch to the extended schedule and probe.
    pub fn on_navigator_offline(&self) {
        info!("Navigator offline");
        self.update(|state, _| {
            state.navigator_offline = true;
            state.backoff.reset(Some(EXTENDED_FIBONACCI_TIMEOUTS));
        });
        self.check();
    }

    /// Permanently disables the manager.
    pub fn on_expiration(&self, reason: ExpirationReason) {
        warn!(%reason, "Expired");
        self.update(|state, _| {
            state.expired = Some(reason);
            state.cancel_reconnect();
        });
        self.logout();
    }

    /// Drops the authenticated channel and forgets the credentials.
    pub fn logout(&self) {
        self.update(|state, fx| {
            if let Some(process) = state.authenticated.clone() {
                fx.push(Effect::Abort(process.clone()));
                state.drop_authenticated(&process, fx);
            }
            state.mark_offline(fx);
            state.credentials = None;
        });
    }

    /// Adds a request handler and flushes queued requests to all handlers.
    pub fn register_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.update(|state, fx| {
            state.handlers.push(handler);
            let queued: Vec<IncomingRequest> = state.queue.drain(..).collect();
            for request in queued {
                fx.push(Effect::Deliver {
                    handlers: state.handlers.clone(),
                    request,
                });
            }
        });
    }

    /// Removes a request handler.
    pub fn unregister_request_handler(&self, handler: &Arc<dyn RequestHandler>) {
        self.inner
            .state
            .lock()
            .handlers
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Opens a fresh provisioning channel whose requests go to `handler`.
    pub async fn get_provisioning_resource(
        &self,
        handler: Arc<dyn RequestHandler>,
    ) -> NetworkResult<Resource> {
        if let Some(reason) = self.inner.state.lock().expired {
            return Err(NetworkError::Expired(reason.to_string()));
        }
        let incoming: IncomingRequestHandler = Arc::new(move |request| handler.handle_request(request));
        self.connect_resource(Channel::Provisioning, None, Some(incoming))
            .result()
            .await
    }

    fn update<R>(&self, f: impl FnOnce(&mut State, &mut Effects) -> R) -> R {
        let mut effects = Effects::new();
        let result = {
            let mut state = self.inner.state.lock();
            f(&mut state, &mut effects)
        };
        self.apply(effects);
        result
    }

    fn apply(&self, effects: Effects) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    let dispatcher = self.inner.events.lock().clone();
                    dispatcher.dispatch(event);
                }
                Effect::Deliver { handlers, request } => {
                    for handler in handlers {
                        handler.handle_request(request.clone());
                    }
                }
                Effect::Disconnect(handlers) => {
                    for handler in handlers {
                        handler.handle_disconnect();
                    }
                }
                Effect::Abort(process) => process.abort(),
            }
        }
    }

    fn snapshot_authenticated(&self) -> (Option<ConnectProcess>, Option<Credentials>) {
        let state = self.inner.state.lock();
        (state.authenticated.clone(), state.credentials.clone())
    }

    fn is_authenticated(&self, headers: &[(String, String)]) -> bool {
        let Some(credentials) = self.inner.state.lock().credentials.clone() else {
            return false;
        };
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .and_then(|(_, value)| Credentials::from_basic_auth(value))
            .is_some_and(|presented| presented == credentials)
    }

    fn connect_resource(
        &self,
        channel: Channel,
        credentials: Option<&Credentials>,
        handler: Option<IncomingRequestHandler>,
    ) -> ConnectProcess {
        let config = &self.inner.config;
        let id = self.inner.process_ids.fetch_add(1, Ordering::Relaxed);
        let (path, keepalive_path) = match channel {
            Channel::Provisioning => (&config.provisioning_path, &config.provisioning_keepalive_path),
            _ => (&config.websocket_path, &config.keepalive_path),
        };

        let url = config.channel_url(path);
        let mut headers = Vec::new();
        if let Some(credentials) = credentials {
            headers.push(("Authorization".to_string(), credentials.basic_auth_header()));
        }
        let resource_config = ResourceConfig {
            name: channel.name().to_string(),
            keepalive: Some(KeepAliveConfig::with_path(keepalive_path)),
            request_timeout: config.request_timeout,
            ..Default::default()
        };
        let proxy = config.proxy.clone();
        let certificate_authority = config.certificate_authority.clone();
        let connect_timeout = config.connect_timeout;
        let dialer = Arc::clone(&self.inner.dialer);

        ConnectProcess::spawn(id, async move {
            let url = url?;
            info!(channel = channel.name(), "Connecting");
            let request = ConnectRequest {
                url,
                headers,
                proxy,
                certificate_authority,
                connect_timeout,
            };
            let socket = tokio::time::timeout(connect_timeout, dialer.connect(request))
                .await
                .map_err(|_| NetworkError::Timeout)??;
            info!(channel = channel.name(), "Connected");
            Ok(Resource::new(socket, resource_config, handler))
        })
    }

    fn connect_authenticated(&self, credentials: Credentials) -> BoxFuture<'static, NetworkResult<()>> {
        let manager = self.clone();
        async move { manager.run_authenticate(credentials).await }.boxed()
    }

    async fn run_authenticate(&self, credentials: Credentials) -> NetworkResult<()> {
        let start = self.update(|state, fx| {
            if let Some(reason) = state.expired {
                return AuthStart::Expired(reason);
            }
            if credentials.is_empty() {
                return AuthStart::Skip;
            }
            if state.credentials.as_ref() == Some(&credentials) {
                if let Some(process) = &state.authenticated {
                    return AuthStart::Join(process.clone());
                }
            }

            state.credentials = Some(credentials.clone());
            state.set_status(ChannelKind::Authenticated, SocketStatus::Connecting, fx);
            let process = self.connect_resource(
                Channel::Authenticated,
                Some(&credentials),
                Some(self.incoming_handler()),
            );
            if let Some(previous) = state.authenticated.replace(process.clone()) {
                fx.push(Effect::Abort(previous));
            }
            AuthStart::Started(process)
        });

        let process = match start {
            AuthStart::Expired(reason) => {
                return Err(NetworkError::Expired(reason.to_string()));
            }
            AuthStart::Skip => {
                warn!("Authenticate called without credentials");
                return Ok(());
            }
            AuthStart::Join(process) => return process.result().await.map(|_| ()),
            AuthStart::Started(process) => process,
        };

        match process.result().await {
            Ok(resource) => {
                let current = self.update(|state, fx| {
                    if !state.is_authenticated_process(&process) {
                        return false;
                    }
                    state.set_status(ChannelKind::Authenticated, SocketStatus::Open, fx);
                    state.backoff.reset(None);
                    state.envelope_count = 0;
                    true
                });
                if current {
                    self.watch_authenticated(process, resource);
                }
                Ok(())
            }
            Err(err) => {
                warn!(%err, "Authenticated connection failed");
                self.update(|state, fx| {
                    if !state.is_authenticated_process(&process) {
                        return;
                    }
                    state.drop_authenticated(&process, fx);
                    if err.is_auth_rejection() {
                        fx.push(Effect::Emit(ManagerEvent::AuthError));
                    } else if err.is_transient() {
                        state.mark_offline(fx);
                        self.schedule_reconnect(state);
                    }
                });
                Err(err)
            }
        }
    }

    fn schedule_reconnect(&self, state: &mut State) {
        if state.expired.is_some() {
            return;
        }
        state.cancel_reconnect();
        let delay = state.backoff.get_and_increment();
        let token = CancellationToken::new();
        state.reconnect = Some(token.clone());
        info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Reconnect wait cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let credentials = {
                let mut state = manager.inner.state.lock();
                if token.is_cancelled() {
                    return;
                }
                state.reconnect = None;
                if state.authenticated.is_some() {
                    debug!("Already connected, skipping reconnect");
                    return;
                }
                state.credentials.clone()
            };
            let Some(credentials) = credentials else {
                return;
            };
            if let Err(err) = manager.connect_authenticated(credentials).await {
                info!(%err, "Reconnect attempt failed");
            }
        });
    }

    fn watch_authenticated(&self, process: ConnectProcess, resource: Resource) {
        let manager = self.clone();
        tokio::spawn(async move {
            let event = resource.closed().await;
            manager.update(|state, fx| {
                if !state.is_authenticated_process(&process) {
                    return;
                }
                warn!(code = event.code, reason = %event.reason, "Authenticated channel closed");
                state.drop_authenticated(&process, fx);
                match event.code {
                    NORMAL_DISCONNECT_CODE => {}
                    CONNECTED_ELSEWHERE_CODE => error!("Account connected elsewhere"),
                    CONNECTION_INVALIDATED_CODE => fx.push(Effect::Emit(ManagerEvent::AuthError)),
                    _ => manager.schedule_reconnect(state),
                }
            });
        });
    }

    fn watch_unauthenticated(&self, process: ConnectProcess, resource: Resource) {
        let manager = self.clone();
        tokio::spawn(async move {
            let event = resource.closed().await;
            debug!(code = event.code, reason = %event.reason, "Unauthenticated channel closed");
            manager.update(|state, fx| state.drop_unauthenticated(&process, fx));
        });
    }

    fn start_unauthenticated_rotation(&self, resource: &Resource) {
        let rotation = self.inner.config.unauthenticated_rotation;
        self.update(|state, _| {
            let Some(process) = state.unauthenticated.clone() else {
                return;
            };
            if !process.peek().is_some_and(|current| current.same_as(resource)) {
                return;
            }
            if state.unauthenticated_rotation.is_some() {
                return;
            }

            let manager = self.clone();
            let resource = resource.clone();
            state.unauthenticated_rotation = Some(tokio::spawn(async move {
                tokio::time::sleep(rotation).await;
                info!("Rotating unauthenticated channel");
                resource.shutdown();

                let still_current = manager.update(|state, fx| {
                    // This task is the rotation itself; detach, never abort.
                    drop(state.unauthenticated_rotation.take());
                    if !state.is_unauthenticated_process(&process) {
                        return false;
                    }
                    state.drop_unauthenticated(&process, fx);
                    true
                });
                if still_current {
                    if let Err(err) = manager.get_unauthenticated_resource().await {
                        warn!(%err, "Failed to reopen unauthenticated channel");
                    }
                }
            }));
        });
    }

    fn incoming_handler(&self) -> IncomingRequestHandler {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |request| {
            if let Some(inner) = inner.upgrade() {
                ChannelManager { inner }.queue_or_handle(request);
            }
        })
    }

    fn queue_or_handle(&self, request: IncomingRequest) {
        self.update(|state, fx| {
            if request.request_type() == ServerRequestType::ApiMessage {
                state.envelope_count += 1;
                if state.envelope_count == 1 {
                    fx.push(Effect::Emit(ManagerEvent::FirstEnvelope {
                        request: request.clone(),
                    }));
                }
            }
            if state.handlers.is_empty() {
                state.queue.push_back(request);
                info!(queued = state.queue.len(), "No handlers, queueing request");
                return;
            }
            fx.push(Effect::Deliver {
                handlers: state.handlers.clone(),
                request,
            });
        });
    }
}
