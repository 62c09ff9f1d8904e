// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mock Transport
//!
//! In-memory dialer for tests. Every successful `connect` produces a
//! [`MockSocket`]: the server end of the connection, which the test drives
//! by hand (reading client frames, answering, closing).
//!
//! # Example
//!
//! ```ignore
//! let dialer = MockDialer::new();
//! let manager = ChannelManager::new(config, dialer.clone());
//! let connecting = tokio::spawn(async move { manager.authenticate(creds).await });
//! let mut server = dialer.accept().await;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::{NetworkError, NetworkResult};
use super::frame::{decode_frame, encode_frame, Frame, RequestFrame, ResponseFrame};
use super::transport::{ConnectRequest, Dialer, SocketCommand, SocketEvent, SocketHandle};

/// What the server end observed from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// The client sent a binary message.
    Message(Vec<u8>),
    /// The client started the closing handshake.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Scripted dialer.
#[derive(Clone)]
pub struct MockDialer {
    inner: Arc<MockDialerInner>,
}

#[derive(Default)]
struct MockDialerInner {
    failures: Mutex<VecDeque<NetworkError>>,
    requests: Mutex<Vec<ConnectRequest>>,
    echo_close: Mutex<bool>,
    accepted: Mutex<Option<mpsc::UnboundedSender<MockSocket>>>,
    pending: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MockSocket>>>,
}

impl MockDialer {
    /// Creates a dialer whose connects succeed and whose sockets confirm
    /// client-initiated closes.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = MockDialerInner {
            echo_close: Mutex::new(true),
            accepted: Mutex::new(Some(sender)),
            pending: tokio::sync::Mutex::new(Some(receiver)),
            ..Default::default()
        };
        MockDialer {
            inner: Arc::new(inner),
        }
    }

    /// Makes the next connect fail with `error`. Failures queue up.
    pub fn fail_next(&self, error: NetworkError) {
        self.inner.failures.lock().push_back(error);
    }

    /// Controls whether the server end confirms client-initiated closes.
    pub fn set_echo_close(&self, echo: bool) {
        *self.inner.echo_close.lock() = echo;
    }

    /// Number of connect attempts so far.
    pub fn dial_count(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Every connect request seen so far.
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.inner.requests.lock().clone()
    }

    /// Waits for the next successful connection and returns its server end.
    ///
    /// # Panics
    ///
    /// Panics if the dialer was dropped.
    pub async fn accept(&self) -> MockSocket {
        let mut pending = self.inner.pending.lock().await;
        match pending.as_mut() {
            Some(receiver) => match receiver.recv().await {
                Some(socket) => socket,
                None => panic!("mock dialer closed"),
            },
            None => panic!("mock dialer closed"),
        }
    }

    /// Returns an already established connection without waiting.
    pub fn try_accept(&self) -> Option<MockSocket> {
        let mut pending = self.inner.pending.try_lock().ok()?;
        pending.as_mut()?.try_recv().ok()
    }
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn connect(&self, request: ConnectRequest) -> NetworkResult<SocketHandle> {
        self.inner.requests.lock().push(request.clone());
        if let Some(error) = self.inner.failures.lock().pop_front() {
            return Err(error);
        }

        let (client_commands, mut commands) = mpsc::unbounded_channel::<SocketCommand>();
        let (events, client_events) = mpsc::unbounded_channel::<SocketEvent>();
        let (observed_tx, observed) = mpsc::unbounded_channel::<ClientAction>();
        let echo_close = *self.inner.echo_close.lock();

        let pump_events = events.clone();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SocketCommand::Send(bytes) => {
                        let _ = observed_tx.send(ClientAction::Message(bytes));
                    }
                    SocketCommand::Close { code, reason } => {
                        let _ = observed_tx.send(ClientAction::Close {
                            code,
                            reason: reason.clone(),
                        });
                        if echo_close {
                            let _ = pump_events.send(SocketEvent::Closed { code, reason });
                        }
                    }
                }
            }
        });

        let socket = MockSocket {
            request,
            events,
            observed,
        };
        if let Some(accepted) = self.inner.accepted.lock().as_ref() {
            let _ = accepted.send(socket);
        }
        Ok(SocketHandle::new(client_commands, client_events))
    }
}

/// Server end of a mock connection.
pub struct MockSocket {
    request: ConnectRequest,
    events: mpsc::UnboundedSender<SocketEvent>,
    observed: mpsc::UnboundedReceiver<ClientAction>,
}

impl MockSocket {
    /// The request the client connected with.
    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Sends raw bytes to the client.
    pub fn send_bytes(&self, bytes: Vec<u8>) {
        let _ = self.events.send(SocketEvent::Message(bytes));
    }

    /// Sends a frame to the client.
    pub fn send_frame(&self, frame: &Frame) -> NetworkResult<()> {
        self.send_bytes(encode_frame(frame)?);
        Ok(())
    }

    /// Sends a request to the client.
    pub fn send_request(&self, id: u64, verb: &str, path: &str) -> NetworkResult<()> {
        self.send_frame(&Frame::Request(RequestFrame {
            id,
            verb: verb.to_string(),
            path: path.to_string(),
            body: None,
            headers: Vec::new(),
        }))
    }

    /// Answers a client request.
    pub fn respond(&self, id: u64, status: u32, message: &str) -> NetworkResult<()> {
        self.send_frame(&Frame::Response(ResponseFrame {
            id,
            status,
            message: message.to_string(),
            body: None,
            headers: Vec::new(),
        }))
    }

    /// Closes the connection from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Reports a transport failure to the client.
    pub fn fail(&self, error: &str) {
        let _ = self.events.send(SocketEvent::Error(error.to_string()));
    }

    /// Waits for the next client action. `None` once the client is gone.
    pub async fn next_action(&mut self) -> Option<ClientAction> {
        self.observed.recv().await
    }

    /// Returns the next client action if one is already queued.
    pub fn try_next_action(&mut self) -> Option<ClientAction> {
        self.observed.try_recv().ok()
    }

    /// Waits for the next frame sent by the client, skipping nothing.
    ///
    /// Returns `None` if the client closed or undecodable bytes arrived.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self.observed.recv().await? {
            ClientAction::Message(bytes) => decode_frame(&bytes).ok(),
            ClientAction::Close { .. } => None,
        }
    }

    /// Waits for the next request the client sent.
    pub async fn next_request(&mut self) -> Option<RequestFrame> {
        match self.next_frame().await? {
            Frame::Request(request) => Some(request),
            Frame::Response(_) => None,
        }
    }

    /// Waits for the next response the client sent.
    pub async fn next_response(&mut self) -> Option<ResponseFrame> {
        match self.next_frame().await? {
            Frame::Response(response) => Some(response),
            Frame::Request(_) => None,
        }
    }

    /// Waits until the client starts the closing handshake and returns its
    /// code and reason, skipping any messages before it.
    pub async fn next_close(&mut self) -> Option<(u16, String)> {
        loop {
            if let ClientAction::Close { code, reason } = self.observed.recv().await? {
                return Some((code, reason));
            }
        }
    }
}
