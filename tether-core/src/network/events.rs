// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event System
//!
//! Callbacks for channel manager events.

use std::sync::Arc;

use super::resource::IncomingRequest;
use super::transport::SocketStatus;

/// Which of the two managed channels an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Channel opened with the account credentials.
    Authenticated,
    /// Channel opened without credentials.
    Unauthenticated,
}

/// Events emitted by the channel manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A channel changed status.
    StatusChange {
        /// The channel.
        channel: ChannelKind,
        /// The new status.
        status: SocketStatus,
    },

    /// The server rejected the credentials or invalidated the device.
    AuthError,

    /// The manager transitioned to online.
    Online,

    /// The manager transitioned to offline.
    Offline,

    /// First message delivery request on a fresh authenticated channel.
    FirstEnvelope {
        /// The request that carried it.
        request: IncomingRequest,
    },
}

/// Event handler trait.
///
/// Implement this trait to receive channel manager events.
pub trait EventHandler: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: ManagerEvent);
}

/// Simple callback-based event handler.
///
/// Wraps a closure for easy event handling.
pub struct CallbackHandler<F>
where
    F: Fn(ManagerEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(ManagerEvent) + Send + Sync,
{
    /// Creates a new callback handler.
    pub fn new(callback: F) -> Self {
        CallbackHandler { callback }
    }
}

impl<F> EventHandler for CallbackHandler<F>
where
    F: Fn(ManagerEvent) + Send + Sync,
{
    fn on_event(&self, event: ManagerEvent) {
        (self.callback)(event);
    }
}

/// Event dispatcher for managing multiple handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    pub fn new() -> Self {
        EventDispatcher {
            handlers: Vec::new(),
        }
    }

    /// Adds an event handler.
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatches an event to all handlers.
    pub fn dispatch(&self, event: ManagerEvent) {
        for handler in &self.handlers {
            handler.on_event(event.clone());
        }
    }
}
