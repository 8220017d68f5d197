use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use attackmap_core::ConnectionId;

use crate::bus::{EventPublisher, PublishError};

use super::connection::{CloseReason, Connection, ConnectionInfo, ConnectionState};
use super::queue::Pacer;
use super::transport::{SubscriberTransport, TransportError};
use super::{FanoutConfig, FanoutError};

/// Handle returned by [`FanoutManager::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: ConnectionId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

struct Slot<M> {
    conn: Arc<Connection<M>>,
    task: Option<JoinHandle<()>>,
}

struct Inner<M> {
    config: FanoutConfig,
    slots: Mutex<HashMap<ConnectionId, Slot<M>>>,
}

impl<M> Inner<M> {
    fn remove(&self, id: ConnectionId) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(&id);
        }
    }
}

/// Broadcasts published records to every `active` subscriber connection.
///
/// Each connection gets its own bounded queue and delivery task; a slow or
/// broken connection only ever affects itself.
pub struct FanoutManager<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for FanoutManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> std::fmt::Debug for FanoutManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutManager")
            .field("config", &self.inner.config)
            .field(
                "connections",
                &self.inner.slots.lock().map(|s| s.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl<M> FanoutManager<M>
where
    M: Send + Sync + 'static,
{
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.inner.config
    }

    /// Admit a new connection.
    ///
    /// Fails with [`FanoutError::CapacityExceeded`] when the connection limit
    /// is reached; existing connections are never evicted to make room.
    pub async fn subscribe<T>(&self, mut transport: T) -> Result<SubscriptionHandle, FanoutError>
    where
        T: SubscriberTransport<M>,
    {
        let conn = self.admit()?;
        let id = conn.id();

        let handshake =
            tokio::time::timeout(self.inner.config.handshake_timeout, transport.handshake()).await;
        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("handshake timed out".to_string()),
        };

        if let Some(reason) = failure {
            conn.begin_close(CloseReason::TransportClosed);
            conn.mark_closed();
            self.inner.remove(id);
            return Err(FanoutError::Handshake(reason));
        }

        if !conn.activate() {
            conn.mark_closed();
            self.inner.remove(id);
            return Err(FanoutError::Handshake("closed during handshake".to_string()));
        }

        let task = tokio::spawn(delivery_loop(self.inner.clone(), conn, transport));
        if let Ok(mut slots) = self.inner.slots.lock() {
            match slots.get_mut(&id) {
                Some(slot) => slot.task = Some(task),
                // Already finished and removed itself.
                None => drop(task),
            }
        }

        info!(connection_id = %id, "subscriber connected");
        Ok(SubscriptionHandle { id })
    }

    /// Request a graceful close; the connection reaches `closed` once any
    /// in-flight delivery completes or times out.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), FanoutError> {
        let conn = self
            .inner
            .slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&handle.id).map(|s| s.conn.clone()))
            .ok_or(FanoutError::UnknownConnection(handle.id))?;

        conn.begin_close(CloseReason::Unsubscribed);
        Ok(())
    }

    /// Number of connections currently in `active` state.
    pub fn live_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .map(|slots| {
                slots
                    .values()
                    .filter(|s| s.conn.state() == ConnectionState::Active)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of admitted connections that have not reached `closed` yet.
    pub fn connection_count(&self) -> usize {
        self.inner.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Diagnostic snapshot of every tracked connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .inner
            .slots
            .lock()
            .map(|slots| slots.values().map(|s| s.conn.info()).collect())
            .unwrap_or_default();
        infos.sort_by_key(|i| i.started_at);
        infos
    }

    /// Close every connection and wait up to `grace` for delivery tasks to finish.
    pub async fn close_all(&self, grace: Duration) {
        let tasks: Vec<JoinHandle<()>> = match self.inner.slots.lock() {
            Ok(mut slots) => slots
                .values_mut()
                .filter_map(|slot| {
                    slot.conn.begin_close(CloseReason::Shutdown);
                    slot.task.take()
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(connections = count, "fan-out shutdown grace period elapsed; aborting deliveries");
            for abort in aborts {
                abort.abort();
            }
            if let Ok(mut slots) = self.inner.slots.lock() {
                slots.clear();
            }
        } else {
            info!(connections = count, "fan-out closed");
        }
    }

    fn admit(&self) -> Result<Arc<Connection<M>>, FanoutError> {
        let max = self.inner.config.max_connections;
        let mut slots = self
            .inner
            .slots
            .lock()
            .map_err(|_| FanoutError::Handshake("connection registry poisoned".to_string()))?;

        if slots.len() >= max {
            warn!(max, "subscriber rejected: connection limit reached");
            return Err(FanoutError::CapacityExceeded { max });
        }

        let conn = Arc::new(Connection::new(self.inner.config.queue_capacity));
        slots.insert(
            conn.id(),
            Slot {
                conn: conn.clone(),
                task: None,
            },
        );
        Ok(conn)
    }
}

impl<M> EventPublisher<M> for FanoutManager<M>
where
    M: Send + Sync + 'static,
{
    fn publish(&self, message: M) -> Result<(), PublishError> {
        let message = Arc::new(message);
        let slots = self.inner.slots.lock().map_err(|_| PublishError::Poisoned)?;

        // Snapshot: only connections active right now get this message.
        for slot in slots.values() {
            slot.conn.enqueue(message.clone());
        }
        Ok(())
    }
}

async fn delivery_loop<M, T>(inner: Arc<Inner<M>>, conn: Arc<Connection<M>>, mut transport: T)
where
    M: Send + Sync + 'static,
    T: SubscriberTransport<M>,
{
    let config = inner.config.clone();
    let mut pacer = Pacer::per_second(config.max_messages_per_sec);

    while conn.state() == ConnectionState::Active {
        if !conn.has_pending() {
            tokio::select! {
                _ = conn.wait_for_work() => {}
                _ = transport.closed() => {
                    conn.begin_close(CloseReason::TransportClosed);
                }
            }
            continue;
        }

        pacer.ready().await;

        // The queue may have been cleared by a close while we were pacing.
        let Some(message) = conn.next_message() else {
            continue;
        };

        match deliver(&mut transport, &message, &config).await {
            Ok(()) => conn.record_delivery(),
            Err(err) => {
                warn!(connection_id = %conn.id(), error = %err, "delivery failed; closing connection");
                conn.begin_close(CloseReason::DeliveryFailed);
            }
        }
    }

    conn.mark_closed();
    inner.remove(conn.id());

    let reason = conn.close_reason().map(|r| r.as_str()).unwrap_or("unknown");
    debug!(connection_id = %conn.id(), reason, "subscriber closed");
}

async fn deliver<M, T>(transport: &mut T, message: &M, config: &FanoutConfig) -> Result<(), TransportError>
where
    T: SubscriberTransport<M>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(config.delivery_timeout, transport.send(message)).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Io("delivery timed out".to_string())),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(TransportError::Closed) => return Err(TransportError::Closed),
            Err(e) if attempt >= config.retry_budget => return Err(e),
            Err(e) => {
                attempt += 1;
                debug!(attempt, error = %e, "delivery attempt failed; retrying");
                tokio::time::sleep(config.retry_backoff).await;
            }
        }
    }
}
