// src/rpc.rs
//! Minimal client for a SpiceTools style WebSocket API.
//!
//! Every request carries a process-unique id and the response with the same
//! id completes it, so several requests may be in flight at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::warn;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::RpcError;
use crate::types::{CardIdentifier, RpcRequest, RpcResponse, Slot};
use crate::ws;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Requests waiting for their response, keyed by id.
#[derive(Default)]
pub struct PendingTable {
    waiters: HashMap<u64, oneshot::Sender<RpcResponse>>,
    closed: bool,
}

impl PendingTable {
    fn register(&mut self, id: u64) -> Result<oneshot::Receiver<RpcResponse>, RpcError> {
        if self.closed {
            return Err(RpcError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok(rx)
    }

    fn forget(&mut self, id: u64) {
        self.waiters.remove(&id);
    }

    pub(crate) fn resolve(&mut self, response: RpcResponse) {
        match self.waiters.remove(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => warn!("Dropping response for unknown request id {}", response.id),
        }
    }

    /// Fails all current and future waiters with `Closed`.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.waiters.clear();
    }
}

pub struct RpcClient {
    frames: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingTable>>,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Connects to `uri`. `timeout` bounds the wait for each response.
    pub async fn connect(uri: &str, timeout: Option<Duration>) -> Result<Self, RpcError> {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let frames = ws::open(uri, pending.clone()).await?;
        Ok(RpcClient {
            frames,
            pending,
            timeout,
        })
    }

    /// Sends one request and waits for its response.
    ///
    /// A response listing errors fails with [`RpcError::Protocol`], carrying
    /// the request frame for diagnostics.
    pub async fn call<P: Serialize>(
        &self,
        module: &str,
        function: &str,
        params: P,
    ) -> Result<RpcResponse, RpcError> {
        let request = RpcRequest {
            id: next_request_id(),
            module,
            function,
            params,
        };
        let id = request.id;
        let frame = serde_json::to_string(&request)?;

        let rx = self.pending.lock().await.register(id)?;
        if self.frames.send(frame.clone()).is_err() {
            self.pending.lock().await.forget(id);
            return Err(RpcError::Closed);
        }

        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().await.forget(id);
                    return Err(RpcError::Timeout { id, timeout: limit });
                }
            },
            None => rx.await,
        }
        .map_err(|_| RpcError::Closed)?;

        if !response.errors.is_empty() {
            return Err(RpcError::Protocol {
                errors: response.errors,
                request: frame,
            });
        }
        Ok(response)
    }

    /// `card.insert` with params `[slot, card_id]`.
    pub async fn card_insert(&self, slot: Slot, card_id: &CardIdentifier) -> Result<(), RpcError> {
        self.call("card", "insert", (slot, card_id.as_str()))
            .await
            .map(|_| ())
    }
}
