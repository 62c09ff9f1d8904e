// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::network::{
    ConnectRequest, Dialer, EventHandler, IncomingRequestHandler, ManagerEvent, MockDialer,
    MockSocket, Resource, ResourceConfig,
};

/// Opens a Resource over a fresh mock connection and returns both ends.
pub async fn open_resource(
    config: ResourceConfig,
    handler: Option<IncomingRequestHandler>,
) -> (Resource, MockSocket) {
    let dialer = MockDialer::new();
    let socket = dialer
        .connect(ConnectRequest::new("wss://chat.example.com/v1/websocket/"))
        .await
        .expect("mock connect");
    let server = dialer.accept().await;
    (Resource::new(socket, config, handler), server)
}

/// Resource settings without keepalive probing.
pub fn quiet_config() -> ResourceConfig {
    ResourceConfig::named("test").with_keepalive(None)
}

/// Records every manager event.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ManagerEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ManagerEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&ManagerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventHandler for EventLog {
    fn on_event(&self, event: ManagerEvent) {
        self.events.lock().push(event);
    }
}
