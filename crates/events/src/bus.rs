//! Publish seam between the store and record consumers.
//!
//! The store calls [`EventPublisher::publish`] once per newly written record,
//! **after** the durable write succeeded. Consumers (the fan-out manager, test
//! observers) receive records in the order the store wrote them.
//!
//! ## Delivery Guarantees
//!
//! - Publishing never blocks on a consumer: implementations enqueue and return
//! - Publishing is best-effort: a consumer that has gone away is simply dropped
//! - No persistence: the durable store is the source of truth, not the publisher

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use thiserror::Error;

/// Publication failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Internal lock poisoning; the publisher is unusable until restart.
    #[error("publisher poisoned")]
    Poisoned,

    /// The publisher has been shut down.
    #[error("publisher closed")]
    Closed,
}

/// Sink for newly written records.
///
/// Object safe so the store can hold `Arc<dyn EventPublisher<EventRecord>>`
/// without caring which consumer sits behind it.
pub trait EventPublisher<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), PublishError>;
}

impl<M, P> EventPublisher<M> for Arc<P>
where
    P: EventPublisher<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), PublishError> {
        (**self).publish(message)
    }
}

/// Publisher that discards everything (no consumers configured).
#[derive(Debug, Default, Copy, Clone)]
pub struct NullPublisher;

impl<M> EventPublisher<M> for NullPublisher {
    fn publish(&self, _message: M) -> Result<(), PublishError> {
        Ok(())
    }
}

/// A blocking subscription to an in-process publisher.
///
/// Messages are received in the order they were published.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}
