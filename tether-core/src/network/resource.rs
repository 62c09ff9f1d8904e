// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multiplexed Resource
//!
//! Many concurrent request/response exchanges over one socket, in both
//! directions. Each [`Resource`] is a cheap handle to a driver task that
//! exclusively owns the socket, the table of pending outgoing requests, the
//! set of incoming requests still awaiting a response, and the id counter.
//!
//! # Lifecycle
//!
//! - `send_request` correlates a response to its request by id.
//! - `shutdown` refuses new work and closes once every outgoing and
//!   incoming request in flight has finished, or after the shutdown timeout.
//! - `close` is idempotent. Pending requests resolve with a synthetic
//!   status `-1` only after the socket confirms the close, or after the close
//!   grace window if it never does.
//! - The close event is published exactly once; see [`Resource::closed`].
//!
//! # Example
//!
//! ```ignore
//! use tether_core::network::{Resource, ResourceConfig, SendRequestOptions};
//!
//! let resource = Resource::new(socket, ResourceConfig::default(), None);
//! let response = resource
//!     .send_request(SendRequestOptions::new("GET", "/v1/profile"))
//!     .await?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use super::error::{NetworkError, NetworkResult};
use super::frame::{decode_frame, encode_frame, Frame, RequestFrame, ResponseFrame};
use super::keepalive::{self, KeepAliveConfig, KeepAliveHandle};
use super::transport::{
    SocketCommand, SocketEvent, SocketHandle, ABNORMAL_CLOSURE_CODE, NORMAL_DISCONNECT_CODE,
    UNEXPECTED_DISCONNECT_CODE,
};

/// Highest request id before the counter wraps back to 1.
pub const MAX_REQUEST_ID: u64 = 0x7fff_ffff;

/// Status sent back for incoming requests that arrive during shutdown.
pub const SHUTTING_DOWN_STATUS: u32 = 503;

/// Default ceiling on how long `shutdown` waits for incoming requests.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for the peer to confirm a locally initiated close.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Timed-out ids kept around so a late response is not a protocol violation.
const RETIRED_ID_CAPACITY: usize = 256;

/// Callback invoked on the driver task for every incoming request.
///
/// It must not block or panic; hand the request off and return. A panic
/// takes down the driver task, and aborts the process in release builds.
pub type IncomingRequestHandler = Arc<dyn Fn(IncomingRequest) + Send + Sync>;

/// Configuration for one Resource.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Name used in logs.
    pub name: String,
    /// Keepalive settings; `None` disables probing.
    pub keepalive: Option<KeepAliveConfig>,
    /// Timeout applied to requests that do not set their own.
    pub request_timeout: Option<Duration>,
    /// Ceiling for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Wait for the peer's close confirmation before closing locally.
    pub close_grace: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            name: "resource".to_string(),
            keepalive: Some(KeepAliveConfig::default()),
            request_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl ResourceConfig {
    /// Creates a config with the given log name.
    pub fn named(name: &str) -> Self {
        ResourceConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Replaces the keepalive settings.
    pub fn with_keepalive(mut self, keepalive: Option<KeepAliveConfig>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Parameters of one outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequestOptions {
    /// Verb.
    pub verb: String,
    /// Path including query.
    pub path: String,
    /// Optional body.
    pub body: Option<Vec<u8>>,
    /// Header lines in `name:value` form.
    pub headers: Vec<String>,
    /// Per-request deadline; falls back to the resource default.
    pub timeout: Option<Duration>,
}

impl SendRequestOptions {
    /// Creates a request without body, headers or timeout.
    pub fn new(verb: &str, path: &str) -> Self {
        SendRequestOptions {
            verb: verb.to_string(),
            path: path.to_string(),
            body: None,
            headers: Vec::new(),
            timeout: None,
        }
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header line.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(format!("{}:{}", name, value));
        self
    }

    /// Sets the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    /// Status code, or [`ResourceResponse::CLOSED_STATUS`] if the connection
    /// closed first.
    pub status: i32,
    /// Status text.
    pub message: String,
    /// Header lines in `name:value` form.
    pub headers: Vec<String>,
    /// Optional body.
    pub body: Option<Vec<u8>>,
}

impl ResourceResponse {
    /// Synthetic status for requests outstanding when the connection closed.
    pub const CLOSED_STATUS: i32 = -1;

    fn connection_closed() -> Self {
        ResourceResponse {
            status: Self::CLOSED_STATUS,
            message: "Connection closed".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Returns true if the connection closed before a response arrived.
    pub fn is_connection_closed(&self) -> bool {
        self.status == Self::CLOSED_STATUS
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<ResponseFrame> for ResourceResponse {
    fn from(frame: ResponseFrame) -> Self {
        ResourceResponse {
            status: i32::try_from(frame.status).unwrap_or(i32::MAX),
            message: frame.message,
            headers: frame.headers,
            body: frame.body,
        }
    }
}

/// How and why a Resource closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl CloseEvent {
    fn new(code: u16, reason: &str) -> Self {
        CloseEvent {
            code,
            reason: reason.to_string(),
        }
    }
}

/// Classification of well-known incoming request paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequestType {
    /// A message delivery.
    ApiMessage,
    /// The server's queue is drained.
    ApiEmptyQueue,
    /// Provisioning envelope.
    ProvisioningMessage,
    /// Provisioning address assignment.
    ProvisioningAddress,
    /// Anything else.
    Unknown,
}

impl ServerRequestType {
    /// Classifies a request path.
    pub fn from_path(path: &str) -> Self {
        match path {
            "/api/v1/message" => ServerRequestType::ApiMessage,
            "/api/v1/queue/empty" => ServerRequestType::ApiEmptyQueue,
            "/v1/message" => ServerRequestType::ProvisioningMessage,
            "/v1/address" => ServerRequestType::ProvisioningAddress,
            _ => ServerRequestType::Unknown,
        }
    }
}

/// A request received from the server.
///
/// Clones share the same response slot: the first `respond` call wins and
/// later calls fail with [`NetworkError::AlreadyResponded`].
#[derive(Clone)]
pub struct IncomingRequest {
    frame: Arc<RequestFrame>,
    commands: mpsc::UnboundedSender<Command>,
    responded: Arc<AtomicBool>,
}

impl IncomingRequest {
    /// Server-assigned id.
    pub fn id(&self) -> u64 {
        self.frame.id
    }

    /// Verb.
    pub fn verb(&self) -> &str {
        &self.frame.verb
    }

    /// Path.
    pub fn path(&self) -> &str {
        &self.frame.path
    }

    /// Body, if any.
    pub fn body(&self) -> Option<&[u8]> {
        self.frame.body.as_deref()
    }

    /// Header lines.
    pub fn headers(&self) -> &[String] {
        &self.frame.headers
    }

    /// Classification by path.
    pub fn request_type(&self) -> ServerRequestType {
        ServerRequestType::from_path(&self.frame.path)
    }

    /// Whether a response was already sent.
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    /// Responds with a status and message.
    pub fn respond(&self, status: u32, message: &str) -> NetworkResult<()> {
        self.respond_with(status, message, Vec::new(), None)
    }

    /// Responds with headers and a body.
    pub fn respond_with(
        &self,
        status: u32,
        message: &str,
        headers: Vec<String>,
        body: Option<Vec<u8>>,
    ) -> NetworkResult<()> {
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyResponded);
        }
        self.commands
            .send(Command::Respond(ResponseFrame {
                id: self.frame.id,
                status,
                message: message.to_string(),
                body,
                headers,
            }))
            .map_err(|_| NetworkError::ConnectionClosed)
    }
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("id", &self.frame.id)
            .field("verb", &self.frame.verb)
            .field("path", &self.frame.path)
            .field("responded", &self.has_responded())
            .finish()
    }
}

/// Handle to a multiplexed connection.
#[derive(Clone)]
pub struct Resource {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<Option<CloseEvent>>,
}

impl Resource {
    /// Takes ownership of an open socket and starts the driver task.
    ///
    /// Must be called from within a tokio runtime. Incoming requests go to
    /// `handler`; without one they are answered `404 Not found`.
    pub fn new(
        socket: SocketHandle,
        config: ResourceConfig,
        handler: Option<IncomingRequestHandler>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let (socket_tx, events) = socket.into_parts();

        let weak = WeakResource {
            commands: commands_tx.downgrade(),
        };
        let keepalive = config
            .keepalive
            .clone()
            .map(|settings| keepalive::spawn(&config.name, settings, weak));

        let driver = Driver {
            name: config.name.clone(),
            request_timeout: config.request_timeout,
            shutdown_timeout: config.shutdown_timeout,
            close_grace: config.close_grace,
            socket: socket_tx,
            events,
            commands: commands_rx,
            commands_tx: commands_tx.downgrade(),
            handles_gone: false,
            handler,
            keepalive,
            closed_tx,
            ids: RequestIdAllocator::new(),
            pending: HashMap::new(),
            retired: VecDeque::new(),
            timeouts: DelayQueue::new(),
            active_incoming: HashSet::new(),
            shutting_down: false,
            closing: None,
            shutdown_deadline: None,
            close_deadline: None,
        };
        tokio::spawn(driver.run());

        debug!(resource = %config.name, "Resource started");
        Resource {
            shared: Arc::new(Shared {
                name: config.name,
                commands: commands_tx,
                closed: closed_rx,
            }),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Sends a request and waits for its response.
    ///
    /// Resolves with status `-1` if the connection closes first. Fails with
    /// [`NetworkError::RequestTimedOut`] when the deadline passes,
    /// [`NetworkError::ShuttingDown`] after `shutdown`, and
    /// [`NetworkError::FrameTooLarge`] for oversized frames.
    pub async fn send_request(
        &self,
        options: SendRequestOptions,
    ) -> NetworkResult<ResourceResponse> {
        let (reply, response) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Send { options, reply })
            .map_err(|_| NetworkError::ConnectionClosed)?;
        response.await.map_err(|_| NetworkError::ConnectionClosed)?
    }

    /// Closes the connection. Later calls are no-ops.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.shared.commands.send(Command::Close(CloseEvent::new(code, reason)));
    }

    /// Refuses new outgoing requests and closes once the requests already in
    /// flight, in both directions, have finished.
    pub fn shutdown(&self) {
        let _ = self.shared.commands.send(Command::Shutdown);
    }

    /// Sends a keepalive probe now, optionally with a shorter response
    /// timeout.
    pub fn force_keep_alive(&self, timeout: Option<Duration>) {
        let _ = self.shared.commands.send(Command::ForceKeepAlive(timeout));
    }

    /// Number of outgoing and incoming requests in flight.
    pub async fn in_flight(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.shared.commands.send(Command::InFlight(reply)).is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// The close event, if the Resource has closed.
    pub fn close_event(&self) -> Option<CloseEvent> {
        self.shared.closed.borrow().clone()
    }

    /// Returns true once the close event was published.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Waits for the close event.
    pub async fn closed(&self) -> CloseEvent {
        let mut receiver = self.shared.closed.clone();
        let waited = receiver
            .wait_for(Option::is_some)
            .await
            .map(|event| event.clone());
        let event = match waited {
            Ok(event) => event,
            Err(_) => receiver.borrow().clone(),
        };
        event.unwrap_or_else(|| CloseEvent::new(ABNORMAL_CLOSURE_CODE, "Driver stopped"))
    }

    /// Returns true if both handles refer to the same connection.
    pub fn same_as(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle used by the keepalive task; it must not keep the Resource alive.
#[derive(Clone)]
pub(crate) struct WeakResource {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl WeakResource {
    pub(crate) fn request(
        &self,
        options: SendRequestOptions,
    ) -> Option<oneshot::Receiver<NetworkResult<ResourceResponse>>> {
        let commands = self.commands.upgrade()?;
        let (reply, response) = oneshot::channel();
        commands.send(Command::Send { options, reply }).ok()?;
        Some(response)
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Close(CloseEvent::new(code, reason)));
        }
    }
}

pub(crate) enum Command {
    Send {
        options: SendRequestOptions,
        reply: oneshot::Sender<NetworkResult<ResourceResponse>>,
    },
    Respond(ResponseFrame),
    Close(CloseEvent),
    Shutdown,
    ForceKeepAlive(Option<Duration>),
    InFlight(oneshot::Sender<usize>),
}

/// Hands out request ids in `[1, MAX_REQUEST_ID]`, wrapping around and
/// skipping ids that are still in use.
#[derive(Debug)]
struct RequestIdAllocator {
    next: u64,
}

impl RequestIdAllocator {
    fn new() -> Self {
        RequestIdAllocator { next: 1 }
    }

    #[cfg(test)]
    fn starting_at(next: u64) -> Self {
        RequestIdAllocator {
            next: next.clamp(1, MAX_REQUEST_ID),
        }
    }

    fn allocate(&mut self, in_use: impl Fn(u64) -> bool) -> u64 {
        loop {
            let id = self.next;
            self.next = if id >= MAX_REQUEST_ID { 1 } else { id + 1 };
            if !in_use(id) {
                return id;
            }
        }
    }
}

struct PendingRequest {
    verb: String,
    path: String,
    reply: oneshot::Sender<NetworkResult<ResourceResponse>>,
    timeout: Option<delay_queue::Key>,
}

struct Driver {
    name: String,
    request_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    close_grace: Duration,
    socket: mpsc::UnboundedSender<SocketCommand>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_tx: mpsc::WeakUnboundedSender<Command>,
    handles_gone: bool,
    handler: Option<IncomingRequestHandler>,
    keepalive: Option<KeepAliveHandle>,
    closed_tx: watch::Sender<Option<CloseEvent>>,
    ids: RequestIdAllocator,
    pending: HashMap<u64, PendingRequest>,
    retired: VecDeque<u64>,
    timeouts: DelayQueue<u64>,
    active_incoming: HashSet<u64>,
    shutting_down: bool,
    closing: Option<CloseEvent>,
    shutdown_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SocketEvent::Message(bytes)) => self.on_message(&bytes),
                    Some(SocketEvent::Error(error)) => {
                        warn!(resource = %self.name, %error, "Socket error");
                        self.close(CloseEvent::new(UNEXPECTED_DISCONNECT_CODE, &error));
                    }
                    Some(SocketEvent::Closed { code, reason }) => {
                        return self.finish(CloseEvent { code, reason });
                    }
                    None => {
                        return self.finish(CloseEvent::new(ABNORMAL_CLOSURE_CODE, "Socket dropped"));
                    }
                },
                command = self.commands.recv(), if !self.handles_gone => match command {
                    Some(command) => self.handle(command),
                    None => {
                        self.handles_gone = true;
                        self.close(CloseEvent::new(NORMAL_DISCONNECT_CODE, "Resource dropped"));
                    }
                },
                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    self.on_timeout(expired.into_inner());
                }
                _ = sleep_until_opt(self.shutdown_deadline), if self.shutdown_deadline.is_some() => {
                    self.shutdown_deadline = None;
                    warn!(resource = %self.name, "Shutdown timed out");
                    self.close(CloseEvent::new(NORMAL_DISCONNECT_CODE, "Shutdown timed out"));
                }
                _ = sleep_until_opt(self.close_deadline), if self.close_deadline.is_some() => {
                    warn!(resource = %self.name, "Peer did not confirm close in time");
                    let event = self
                        .closing
                        .clone()
                        .unwrap_or_else(|| CloseEvent::new(ABNORMAL_CLOSURE_CODE, "Close timed out"));
                    return self.finish(event);
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Send { options, reply } => self.send_request(options, reply),
            Command::Respond(response) => self.send_response(response),
            Command::Close(event) => self.close(event),
            Command::Shutdown => self.shutdown(),
            Command::ForceKeepAlive(timeout) => {
                if let Some(keepalive) = &self.keepalive {
                    keepalive.force(timeout);
                }
            }
            Command::InFlight(reply) => {
                let _ = reply.send(self.pending.len() + self.active_incoming.len());
            }
        }
    }

    fn send_request(
        &mut self,
        options: SendRequestOptions,
        reply: oneshot::Sender<NetworkResult<ResourceResponse>>,
    ) {
        if self.closing.is_some() {
            let _ = reply.send(Err(NetworkError::ConnectionClosed));
            return;
        }
        if self.shutting_down {
            let _ = reply.send(Err(NetworkError::ShuttingDown));
            return;
        }

        let pending = &self.pending;
        let retired = &self.retired;
        let id = self
            .ids
            .allocate(|id| pending.contains_key(&id) || retired.contains(&id));

        let frame = Frame::Request(RequestFrame {
            id,
            verb: options.verb.clone(),
            path: options.path.clone(),
            body: options.body,
            headers: options.headers,
        });
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if self.socket.send(SocketCommand::Send(bytes)).is_err() {
            let _ = reply.send(Err(NetworkError::ConnectionClosed));
            return;
        }

        let timeout = options
            .timeout
            .or(self.request_timeout)
            .map(|after| self.timeouts.insert(id, after));
        debug!(resource = %self.name, request_id = id, verb = %options.verb, path = %options.path, "Sent request");
        self.pending.insert(
            id,
            PendingRequest {
                verb: options.verb,
                path: options.path,
                reply,
                timeout,
            },
        );
    }

    fn send_response(&mut self, response: ResponseFrame) {
        if !self.active_incoming.remove(&response.id) {
            debug!(resource = %self.name, request_id = response.id, "Response for inactive request dropped");
            return;
        }
        self.write(&Frame::Response(response));
        self.check_drained();
    }

    fn write(&mut self, frame: &Frame) {
        match encode_frame(frame) {
            Ok(bytes) => {
                let _ = self.socket.send(SocketCommand::Send(bytes));
            }
            Err(err) => warn!(resource = %self.name, %err, "Failed to encode frame"),
        }
    }

    fn on_message(&mut self, bytes: &[u8]) {
        if let Some(keepalive) = &self.keepalive {
            keepalive.reset();
        }

        match decode_frame(bytes) {
            Ok(Frame::Request(request)) => self.on_request(request),
            Ok(Frame::Response(response)) => self.on_response(response),
            Err(err) => {
                warn!(resource = %self.name, %err, "Dropping connection");
                self.close(CloseEvent::new(
                    UNEXPECTED_DISCONNECT_CODE,
                    "Protocol violation",
                ));
            }
        }
    }

    fn on_request(&mut self, request: RequestFrame) {
        let id = request.id;
        if self.shutting_down {
            self.write(&Frame::Response(ResponseFrame {
                id,
                status: SHUTTING_DOWN_STATUS,
                message: "Shutting down".to_string(),
                ..Default::default()
            }));
            return;
        }

        let commands = if self.handler.is_some() {
            self.commands_tx.upgrade()
        } else {
            None
        };
        let Some(commands) = commands else {
            self.write(&Frame::Response(ResponseFrame {
                id,
                status: 404,
                message: "Not found".to_string(),
                ..Default::default()
            }));
            return;
        };

        self.active_incoming.insert(id);
        let incoming = IncomingRequest {
            frame: Arc::new(request),
            commands,
            responded: Arc::new(AtomicBool::new(false)),
        };
        if let Some(handler) = &self.handler {
            handler(incoming);
        }
    }

    fn on_response(&mut self, response: ResponseFrame) {
        let id = response.id;
        match self.pending.remove(&id) {
            Some(pending) => {
                if let Some(key) = pending.timeout {
                    self.timeouts.remove(&key);
                }
                let _ = pending.reply.send(Ok(ResourceResponse::from(response)));
                self.check_drained();
            }
            None if self.retired.contains(&id) => {
                debug!(resource = %self.name, request_id = id, "Late response after timeout");
            }
            None => {
                warn!(resource = %self.name, request_id = id, "Unmatched response");
                self.close(CloseEvent::new(
                    UNEXPECTED_DISCONNECT_CODE,
                    "Unmatched response id",
                ));
            }
        }
    }

    fn on_timeout(&mut self, id: u64) {
        if let Some(pending) = self.pending.remove(&id) {
            info!(resource = %self.name, request_id = id, path = %pending.path, "Request timed out");
            if self.retired.len() == RETIRED_ID_CAPACITY {
                self.retired.pop_front();
            }
            self.retired.push_back(id);
            let _ = pending.reply.send(Err(NetworkError::RequestTimedOut {
                verb: pending.verb,
                path: pending.path,
            }));
            self.check_drained();
        }
    }

    fn shutdown(&mut self) {
        if self.closing.is_some() || self.shutting_down {
            return;
        }
        self.shutting_down = true;
        if self.is_drained() {
            self.close(CloseEvent::new(NORMAL_DISCONNECT_CODE, "Shutdown"));
            return;
        }
        info!(
            resource = %self.name,
            outgoing = self.pending.len(),
            incoming = self.active_incoming.len(),
            "Shutting down, waiting for active requests"
        );
        self.shutdown_deadline = Some(Instant::now() + self.shutdown_timeout);
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.active_incoming.is_empty()
    }

    fn check_drained(&mut self) {
        if self.shutting_down && self.closing.is_none() && self.is_drained() {
            self.close(CloseEvent::new(NORMAL_DISCONNECT_CODE, "Shutdown"));
        }
    }

    fn close(&mut self, event: CloseEvent) {
        if self.closing.is_some() {
            debug!(resource = %self.name, "Already closing");
            return;
        }
        info!(resource = %self.name, code = event.code, reason = %event.reason, "Closing");
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        let _ = self.socket.send(SocketCommand::Close {
            code: event.code,
            reason: event.reason.clone(),
        });
        self.closing = Some(event);
        self.shutdown_deadline = None;
        self.close_deadline = Some(Instant::now() + self.close_grace);
    }

    fn finish(mut self, event: CloseEvent) {
        let event = self.closing.take().unwrap_or(event);
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Ok(ResourceResponse::connection_closed()));
        }
        self.timeouts.clear();
        self.active_incoming.clear();

        info!(resource = %self.name, code = event.code, reason = %event.reason, "Closed");
        self.closed_tx.send_replace(Some(event));
    }
}

// INLINE_TEST_REQUIRED: Exercises the private request id allocator
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ids_start_at_one() {
        let mut ids = RequestIdAllocator::new();
        assert_eq!(ids.allocate(|_| false), 1);
        assert_eq!(ids.allocate(|_| false), 2);
    }

    #[test]
    fn test_ids_wrap_to_one_after_max() {
        let mut ids = RequestIdAllocator::starting_at(MAX_REQUEST_ID);
        assert_eq!(ids.allocate(|_| false), MAX_REQUEST_ID);
        assert_eq!(ids.allocate(|_| false), 1);
    }

    #[test]
    fn test_ids_skip_in_use_after_wrap() {
        let mut ids = RequestIdAllocator::starting_at(MAX_REQUEST_ID);
        let in_use = |id: u64| id == 1 || id == 2;
        assert_eq!(ids.allocate(in_use), MAX_REQUEST_ID);
        assert_eq!(ids.allocate(in_use), 3);
    }

    #[test]
    fn test_server_request_type_from_path() {
        assert_eq!(
            ServerRequestType::from_path("/api/v1/message"),
            ServerRequestType::ApiMessage
        );
        assert_eq!(
            ServerRequestType::from_path("/api/v1/queue/empty"),
            ServerRequestType::ApiEmptyQueue
        );
        assert_eq!(
            ServerRequestType::from_path("/v1/address"),
            ServerRequestType::ProvisioningAddress
        );
        assert_eq!(
            ServerRequestType::from_path("/something/else"),
            ServerRequestType::Unknown
        );
    }

    proptest! {
        #[test]
        fn prop_allocated_id_is_in_range_and_free(
            start in 1u64..=MAX_REQUEST_ID,
            taken in proptest::collection::hash_set(1u64..=MAX_REQUEST_ID, 0..64),
        ) {
            let mut ids = RequestIdAllocator::starting_at(start);
            let id = ids.allocate(|id| taken.contains(&id));
            prop_assert!(id >= 1 && id <= MAX_REQUEST_ID);
            prop_assert!(!taken.contains(&id));
        }
    }
}
