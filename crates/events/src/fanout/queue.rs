use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Bounded FIFO; on overflow the oldest entry is discarded.
#[derive(Debug)]
pub(crate) struct OutboundQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> OutboundQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Push to the back. Returns `true` if an older entry had to be dropped.
    pub(crate) fn push(&mut self, item: T) -> bool {
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front();
            true
        } else {
            false
        };
        self.items.push_back(item);
        dropped
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

/// Enforces a minimum gap between consecutive sends.
#[derive(Debug)]
pub(crate) struct Pacer {
    gap: Duration,
    next: Option<Instant>,
}

impl Pacer {
    pub(crate) fn per_second(rate: u32) -> Self {
        let gap = if rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / rate
        };
        Self { gap, next: None }
    }

    /// Wait until the next send slot is open and reserve it.
    pub(crate) async fn ready(&mut self) {
        if let Some(next) = self.next {
            tokio::time::sleep_until(next).await;
        }
        self.next = Some(Instant::now() + self.gap);
    }
}
