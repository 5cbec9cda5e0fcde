use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use pulse_core::FeedEvent;
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

const LOG_TARGET: &str = "pulse::bus";

/// Attempts `publish` makes before giving up on a transiently-full queue.
const PUBLISH_MAX_ATTEMPTS: u32 = 3;
/// First retry backoff; doubles per attempt.
const PUBLISH_BACKOFF_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Snafu)]
pub enum BusError {
    #[snafu(display("Event bus is unavailable"))]
    Unavailable,
    #[snafu(display("Event bus is full ({capacity} messages)"))]
    Full { capacity: usize },
    #[snafu(display("Receipt does not match any in-flight message"))]
    StaleReceipt,
    #[snafu(display("Event encoding failed"))]
    Codec { source: serde_json::Error },
}
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Opaque handle tying an [`ack`](EventBus::ack) to one specific delivery.
///
/// A receipt dies with its delivery: once the visibility timeout returns the
/// message to the queue, acking the old receipt fails as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(u64);

/// One delivered message. The body is the raw JSON payload; consumers own
/// parsing (and therefore poison-message handling).
#[derive(Debug, Clone)]
pub struct Message {
    pub receipt: Receipt,
    pub body: String,
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStatus {
    pub queued: usize,
    pub in_flight: usize,
    pub dead: usize,
}

#[derive(Debug)]
struct QueuedMessage {
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlightMessage {
    message: QueuedMessage,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct BusInner {
    pending: VecDeque<QueuedMessage>,
    in_flight: HashMap<u64, InFlightMessage>,
    dead: Vec<QueuedMessage>,
    next_receipt: u64,
}

/// At-least-once queue of [`FeedEvent`]s.
///
/// Delivery contract: a received message stays invisible for the visibility
/// timeout; an ack within that window removes it, anything else redelivers
/// it. A message handed out more than `max_receives` times is diverted to
/// the dead-letter sink and never seen by consumers again. Ordering is not
/// guaranteed and duplicates are possible; consumers must be idempotent.
#[derive(Debug)]
pub struct EventBus {
    inner: Mutex<BusInner>,
    /// Bumped on publish so long-polling receivers wake promptly.
    wake: watch::Sender<u64>,
    visibility_timeout: Duration,
    max_receives: u32,
    capacity: usize,
    available: AtomicBool,
}

impl EventBus {
    pub fn new(visibility_timeout: Duration, max_receives: u32, capacity: usize) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            inner: Mutex::new(BusInner::default()),
            wake,
            visibility_timeout,
            max_receives,
            capacity,
            available: AtomicBool::new(true),
        }
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
        debug!(target: LOG_TARGET, available, "Bus availability changed");
    }

    /// Enqueue an event, retrying a transiently-full queue with exponential
    /// backoff up to [`PUBLISH_MAX_ATTEMPTS`]. The message is committed to
    /// the queue before this returns.
    pub async fn publish(&self, event: &FeedEvent) -> BusResult<()> {
        let body = serde_json::to_string(event).context(CodecSnafu)?;
        self.publish_raw(body).await
    }

    /// Raw-body variant of [`Self::publish`]; normal producers go through
    /// the typed form, this one exists for tooling and for exercising the
    /// poison-message path.
    pub async fn publish_raw(&self, body: String) -> BusResult<()> {
        let mut backoff = PUBLISH_BACKOFF_BASE;
        for attempt in 1..=PUBLISH_MAX_ATTEMPTS {
            match self.try_publish(&body) {
                Ok(()) => {
                    debug!(target: LOG_TARGET, attempt, "Event published");
                    return Ok(());
                }
                Err(err @ BusError::Full { .. }) if attempt < PUBLISH_MAX_ATTEMPTS => {
                    warn!(target: LOG_TARGET, attempt, %err, "Publish failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop either returns or retries")
    }

    fn try_publish(&self, body: &str) -> BusResult<()> {
        if !self.available() {
            return UnavailableSnafu.fail();
        }

        let mut inner = self.inner.lock().expect("locking failed");
        if self.capacity <= inner.pending.len() + inner.in_flight.len() {
            return FullSnafu {
                capacity: self.capacity,
            }
            .fail();
        }

        inner.pending.push_back(QueuedMessage {
            body: body.to_owned(),
            receive_count: 0,
        });
        drop(inner);

        self.wake.send_modify(|epoch| *epoch += 1);
        Ok(())
    }

    /// Long-poll for up to `max_count` messages, waiting at most `wait`.
    ///
    /// Expired in-flight messages are returned to the queue first, so a
    /// single consumer calling this in a loop is enough to drive
    /// redelivery; no background sweeper exists.
    pub async fn receive(&self, max_count: usize, wait: Duration) -> BusResult<Vec<Message>> {
        let deadline = Instant::now() + wait;
        let mut wake_rx = self.wake.subscribe();

        loop {
            if !self.available() {
                return UnavailableSnafu.fail();
            }

            let now = Instant::now();
            let (batch, next_expiry) = self.poll_batch(max_count, now);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if deadline <= now {
                return Ok(vec![]);
            }

            let sleep_until = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = tokio::time::sleep_until(sleep_until) => {}
                res = wake_rx.changed() => {
                    if res.is_err() {
                        return Ok(vec![]);
                    }
                }
            }
        }
    }

    fn poll_batch(&self, max_count: usize, now: Instant) -> (Vec<Message>, Option<Instant>) {
        let mut inner = self.inner.lock().expect("locking failed");

        // Visibility timeouts first: anything expired becomes pending again.
        let expired: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.expires_at <= now)
            .map(|(&receipt, _)| receipt)
            .collect();
        for receipt in expired {
            let in_flight = inner
                .in_flight
                .remove(&receipt)
                .expect("receipt collected above");
            debug!(target: LOG_TARGET, receive_count = in_flight.message.receive_count, "Visibility timeout, requeueing");
            inner.pending.push_back(in_flight.message);
        }

        let mut batch = vec![];
        while batch.len() < max_count {
            let Some(mut message) = inner.pending.pop_front() else {
                break;
            };

            message.receive_count += 1;
            if self.max_receives < message.receive_count {
                warn!(
                    target: LOG_TARGET,
                    receive_count = message.receive_count,
                    max_receives = self.max_receives,
                    "Message exceeded delivery limit, dead-lettering"
                );
                inner.dead.push(message);
                continue;
            }

            let receipt = inner.next_receipt;
            inner.next_receipt += 1;
            batch.push(Message {
                receipt: Receipt(receipt),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            inner.in_flight.insert(
                receipt,
                InFlightMessage {
                    message,
                    expires_at: now + self.visibility_timeout,
                },
            );
        }

        let next_expiry = inner
            .in_flight
            .values()
            .map(|in_flight| in_flight.expires_at)
            .min();
        (batch, next_expiry)
    }

    /// Remove a delivered message for good. Fails with [`BusError::StaleReceipt`]
    /// when the visibility timeout already returned the message to the queue.
    pub fn ack(&self, receipt: Receipt) -> BusResult<()> {
        if !self.available() {
            return UnavailableSnafu.fail();
        }

        let mut inner = self.inner.lock().expect("locking failed");
        if inner.in_flight.remove(&receipt.0).is_none() {
            return StaleReceiptSnafu.fail();
        }
        Ok(())
    }

    pub fn status(&self) -> BusStatus {
        let inner = self.inner.lock().expect("locking failed");
        BusStatus {
            queued: inner.pending.len(),
            in_flight: inner.in_flight.len(),
            dead: inner.dead.len(),
        }
    }

    /// Bodies currently in the dead-letter sink, oldest first.
    pub fn dead_letter_bodies(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("locking failed");
        inner.dead.iter().map(|m| m.body.clone()).collect()
    }
}
