use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use attackmap_core::ConnectionId;

use super::queue::OutboundQueue;

/// Lifecycle state of a subscriber connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a connection left `active`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Unsubscribed,
    TransportClosed,
    DeliveryFailed,
    Shutdown,
}

impl CloseReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::DeliveryFailed => "delivery_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Point-in-time view of a connection (diagnostics).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub started_at: DateTime<Utc>,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    reason: Option<CloseReason>,
    last_delivery_at: Option<DateTime<Utc>>,
}

/// Shared state of one connection (registry + delivery task).
#[derive(Debug)]
pub(crate) struct Connection<M> {
    id: ConnectionId,
    started_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    queue: Mutex<OutboundQueue<Arc<M>>>,
    wake: Notify,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<M> Connection<M> {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            started_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                reason: None,
                last_delivery_at: None,
            }),
            queue: Mutex::new(OutboundQueue::new(queue_capacity)),
            wake: Notify::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lifecycle
            .lock()
            .map(|l| l.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().ok().and_then(|l| l.reason)
    }

    /// `connecting -> active`. Returns `false` if the connection was closed meanwhile.
    pub(crate) fn activate(&self) -> bool {
        match self.lifecycle.lock() {
            Ok(mut l) if l.state == ConnectionState::Connecting => {
                l.state = ConnectionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Move to `closing` (idempotent; the first reason wins).
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        let changed = match self.lifecycle.lock() {
            Ok(mut l) => match l.state {
                ConnectionState::Connecting | ConnectionState::Active => {
                    l.state = ConnectionState::Closing;
                    l.reason = Some(reason);
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };
        if changed {
            if let Ok(mut q) = self.queue.lock() {
                q.clear();
            }
            self.wake.notify_one();
        }
        changed
    }

    pub(crate) fn mark_closed(&self) {
        if let Ok(mut l) = self.lifecycle.lock() {
            l.state = ConnectionState::Closed;
        }
    }

    /// Enqueue for delivery; only `active` connections accept messages.
    pub(crate) fn enqueue(&self, message: Arc<M>) {
        if self.state() != ConnectionState::Active {
            return;
        }
        let dropped = match self.queue.lock() {
            Ok(mut q) => q.push(message),
            Err(_) => return,
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.wake.notify_one();
    }

    pub(crate) fn next_message(&self) -> Option<Arc<M>> {
        self.queue.lock().ok().and_then(|mut q| q.pop())
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.queue.lock().map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub(crate) async fn wait_for_work(&self) {
        self.wake.notified().await
    }

    pub(crate) fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut l) = self.lifecycle.lock() {
            l.last_delivery_at = Some(Utc::now());
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let (state, last_delivery_at) = self
            .lifecycle
            .lock()
            .map(|l| (l.state, l.last_delivery_at))
            .unwrap_or((ConnectionState::Closed, None));

        ConnectionInfo {
            id: self.id,
            state,
            started_at: self.started_at,
            last_delivery_at,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
