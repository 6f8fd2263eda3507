//! Credit-based flow control between processors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::processor::Processor;
use super::ProcessorError;
use crate::token::Token;

/// Flow-control state of one upstream→downstream link.
///
/// Credit is granted with [`request`](Subscription::request) and consumed
/// one unit per delivery. A link starts with zero credit: nothing flows
/// until the consumer side asks. [`cancel`](Subscription::cancel) is
/// idempotent and permanently stops deliveries.
pub struct Subscription {
    credit: AtomicU64,
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            credit: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

impl Subscription {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `n` more deliveries.
    pub fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.credit.fetch_add(n, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Stop the link. Safe to call repeatedly and from any task.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn credit(&self) -> u64 {
        self.credit.load(Ordering::Acquire)
    }

    fn try_take(&self) -> bool {
        let mut current = self.credit.load(Ordering::Acquire);
        while current > 0 {
            match self.credit.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    /// Wait until a unit of credit is consumed or the link is cancelled.
    /// Returns `false` on cancellation.
    pub(crate) async fn acquire(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            if self.try_take() {
                return true;
            }
            let notified = self.notify.notified();
            // Close the race between the checks above and registering.
            if self.is_cancelled() {
                return false;
            }
            if self.try_take() {
                return true;
            }
            notified.await;
        }
    }
}

/// One wired edge of the processor network: a target processor plus the
/// subscription regulating deliveries into it.
#[derive(Clone)]
pub struct Downstream {
    processor: Arc<Processor>,
    subscription: Arc<Subscription>,
    replenish: bool,
}

impl Downstream {
    /// Strict-credit link: every delivery permanently consumes one granted
    /// unit.
    #[must_use]
    pub fn new(processor: Arc<Processor>, subscription: Arc<Subscription>) -> Self {
        Self {
            processor,
            subscription,
            replenish: false,
        }
    }

    /// Self-replenishing link: one unit is granted back after each
    /// completed delivery, keeping a constant window of outstanding work.
    /// This is how the registry wires the network.
    #[must_use]
    pub fn replenishing(processor: Arc<Processor>, subscription: Arc<Subscription>) -> Self {
        Self {
            processor,
            subscription,
            replenish: true,
        }
    }

    #[must_use]
    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    /// Deliver a token under credit. Awaits while credit is exhausted;
    /// returns `Ok(false)` without delivering when the link is cancelled.
    pub async fn deliver(&self, token: Token) -> Result<bool, ProcessorError> {
        if !self.subscription.acquire().await {
            return Ok(false);
        }
        let result = self.processor.on_next(token).await;
        if self.replenish {
            self.subscription.request(1);
        }
        result.map(|()| true)
    }
}
