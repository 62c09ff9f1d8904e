// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connect Process
//!
//! One in-flight connection attempt that any number of callers can await.
//! Aborting it cancels the dial, or closes the Resource it produced.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{NetworkError, NetworkResult};
use super::resource::Resource;
use super::transport::NORMAL_DISCONNECT_CODE;

#[derive(Clone)]
pub(crate) struct ConnectProcess {
    id: u64,
    result: Shared<BoxFuture<'static, NetworkResult<Resource>>>,
    cancel: CancellationToken,
}

impl ConnectProcess {
    /// Starts `connect` on its own task so it progresses without waiters.
    pub(crate) fn spawn<F>(id: u64, connect: F) -> Self
    where
        F: Future<Output = NetworkResult<Resource>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => Err(NetworkError::Aborted),
                result = connect => match result {
                    Ok(resource) if guard.is_cancelled() => {
                        resource.close(NORMAL_DISCONNECT_CODE, "Aborted");
                        Err(NetworkError::Aborted)
                    }
                    other => other,
                },
            }
        });

        let result = async move {
            task.await
                .unwrap_or_else(|e| Err(NetworkError::ConnectionFailed(e.to_string())))
        }
        .boxed()
        .shared();

        ConnectProcess { id, result, cancel }
    }

    pub(crate) fn is(&self, other: &ConnectProcess) -> bool {
        self.id == other.id
    }

    pub(crate) async fn result(&self) -> NetworkResult<Resource> {
        self.result.clone().await
    }

    /// The Resource, if the attempt already succeeded.
    pub(crate) fn peek(&self) -> Option<Resource> {
        match self.result.peek() {
            Some(Ok(resource)) => Some(resource.clone()),
            _ => None,
        }
    }

    pub(crate) fn abort(&self) {
        debug!(process = self.id, "Aborting connect process");
        self.cancel.cancel();
        let result = self.result.clone();
        tokio::spawn(async move {
            if let Ok(resource) = result.await {
                resource.close(NORMAL_DISCONNECT_CODE, "Aborted");
            }
        });
    }
}
