//! [`DeviceLink`] – cached, cancellable request/response calls to devices.
//!
//! One connection is kept per endpoint URL and shared by every caller.
//! Writes on a connection are serialised; each write enqueues a waiter and a
//! per-connection reader task hands incoming frames to waiters in write
//! order, so every call is matched with exactly one response frame.
//!
//! Dialing holds only a per-endpoint gate, so a slow dial never blocks calls
//! to other endpoints.
//!
//! Cancelling a call returns immediately and leaves the connection open:
//! the reader still consumes the abandoned response.  Only an I/O error
//! evicts and closes the connection; the next call dials again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use botflow_types::BotError;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Dialer, Transport, WsDialer};

type Waiter = oneshot::Sender<Result<String, BotError>>;

/// An established connection plus its response queue.
struct CachedConnection {
    endpoint: String,
    transport: Arc<dyn Transport>,
    /// Waiters in write order.  Also serves as the write lock.
    pending: Arc<Mutex<VecDeque<Waiter>>>,
    alive: Arc<AtomicBool>,
}

impl CachedConnection {
    fn open(endpoint: &str, transport: Arc<dyn Transport>) -> Arc<Self> {
        let conn = Arc::new(Self {
            endpoint: endpoint.to_string(),
            transport,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            alive: Arc::new(AtomicBool::new(true)),
        });
        tokio::spawn(read_loop(
            conn.endpoint.clone(),
            Arc::clone(&conn.transport),
            Arc::clone(&conn.pending),
            Arc::clone(&conn.alive),
        ));
        conn
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write `frame` and register for the response.
    async fn submit(&self, frame: String) -> Result<oneshot::Receiver<Result<String, BotError>>, BotError> {
        let mut pending = self.pending.lock().await;
        if !self.is_alive() {
            return Err(BotError::connection(&self.endpoint, "connection closed"));
        }
        self.transport.send(frame).await?;
        let (tx, rx) = oneshot::channel();
        pending.push_back(tx);
        Ok(rx)
    }
}

async fn read_loop(
    endpoint: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<VecDeque<Waiter>>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match transport.recv().await {
            Ok(frame) => match pending.lock().await.pop_front() {
                // The receiver is gone when its call was cancelled.
                Some(waiter) => {
                    let _ = waiter.send(Ok(frame));
                }
                None => warn!(endpoint = %endpoint, "dropping unsolicited frame"),
            },
            Err(e) => {
                alive.store(false, Ordering::Release);
                let mut pending = pending.lock().await;
                debug!(endpoint = %endpoint, error = %e, waiting = pending.len(), "reader stopped");
                for waiter in pending.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
                return;
            }
        }
    }
}

/// Connection cache keyed by endpoint URL.
pub struct DeviceLink {
    dialer: Arc<dyn Dialer>,
    connections: Mutex<HashMap<String, Arc<CachedConnection>>>,
    /// One dial at a time per endpoint.
    dial_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for DeviceLink {
    fn default() -> Self {
        Self::new(Arc::new(WsDialer))
    }
}

impl DeviceLink {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connections: Mutex::new(HashMap::new()),
            dial_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Send `request` to `endpoint` and wait for one response frame.
    ///
    /// # Errors
    ///
    /// * [`BotError::Canceled`] when `cancel` fires first; the connection
    ///   stays cached.
    /// * [`BotError::ConnectionFailure`] on dial, write or read failure; the
    ///   connection is evicted.
    pub async fn call(
        &self,
        endpoint: &str,
        request: String,
        cancel: &CancellationToken,
    ) -> Result<String, BotError> {
        if cancel.is_cancelled() {
            return Err(canceled(endpoint));
        }

        let conn = tokio::select! {
            _ = cancel.cancelled() => return Err(canceled(endpoint)),
            conn = self.connection(endpoint) => conn?,
        };

        let reply = match conn.submit(request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.evict(&conn).await;
                return Err(e);
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(endpoint, "call canceled; response will be discarded");
                Err(canceled(endpoint))
            }
            outcome = reply => match outcome {
                Ok(Ok(frame)) => Ok(frame),
                Ok(Err(e)) => {
                    self.evict(&conn).await;
                    Err(e)
                }
                Err(_) => {
                    self.evict(&conn).await;
                    Err(BotError::connection(endpoint, "connection reader stopped"))
                }
            },
        }
    }

    /// Number of cached connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, conn) in drained {
            conn.transport.close().await;
        }
    }

    /// Reuse the cached connection for `endpoint` or dial a new one.
    async fn connection(&self, endpoint: &str) -> Result<Arc<CachedConnection>, BotError> {
        if let Some(conn) = self.cached(endpoint).await {
            return Ok(conn);
        }

        let gate = Arc::clone(
            self.dial_gates
                .lock()
                .await
                .entry(endpoint.to_string())
                .or_default(),
        );
        let _dialing = gate.lock().await;
        // Another caller may have dialed while we waited on the gate.
        if let Some(conn) = self.cached(endpoint).await {
            return Ok(conn);
        }

        let transport = self.dialer.dial(endpoint).await?;
        info!(endpoint, "device connection established");
        let conn = CachedConnection::open(endpoint, transport);
        self.connections
            .lock()
            .await
            .insert(endpoint.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Live cached connection for `endpoint`; a dead entry is dropped.
    async fn cached(&self, endpoint: &str) -> Option<Arc<CachedConnection>> {
        let mut connections = self.connections.lock().await;
        match connections.get(endpoint) {
            Some(conn) if conn.is_alive() => Some(Arc::clone(conn)),
            Some(_) => {
                connections.remove(endpoint);
                None
            }
            None => None,
        }
    }

    /// Drop `conn` from the cache if it is still the cached entry, then close it.
    async fn evict(&self, conn: &Arc<CachedConnection>) {
        {
            let mut connections = self.connections.lock().await;
            if connections
                .get(&conn.endpoint)
                .is_some_and(|cached| Arc::ptr_eq(cached, conn))
            {
                connections.remove(&conn.endpoint);
            }
        }
        conn.alive.store(false, Ordering::Release);
        warn!(endpoint = %conn.endpoint, "evicting device connection");
        conn.transport.close().await;
    }
}

fn canceled(endpoint: &str) -> BotError {
    BotError::Canceled(format!("call to {endpoint} canceled"))
}
