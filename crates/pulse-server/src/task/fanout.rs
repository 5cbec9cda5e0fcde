use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use pulse_bus::{EventBus, Message, Receipt};
use pulse_cache::{CacheError, TimelineCache};
use pulse_core::{FeedEvent, PostId, Timestamp, UserId};
use pulse_db::{Database, DbError};
use pulse_util_error::FmtCompact as _;
use snafu::Snafu;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::SharedState;

const LOG_TARGET: &str = "pulse::fanout";

/// Messages pulled per long-poll.
const RECEIVE_BATCH: usize = 10;
/// Long-poll duration; also bounds how long shutdown waits for an idle
/// worker.
const RECEIVE_WAIT: Duration = Duration::from_secs(20);
/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
enum FanoutError {
    #[snafu(transparent)]
    Db { source: DbError },
    #[snafu(transparent)]
    Cache { source: CacheError },
}

enum Outcome {
    Delivered { followers: usize },
    SkippedCelebrity,
    SkippedMissingAuthor,
}

/// Queue consumer that writes fresh posts into follower timelines.
///
/// Any number of instances may share the bus: entry uniqueness in the cache
/// makes redelivered and concurrently-processed messages converge to the
/// same state, so at-least-once delivery is enough.
pub struct FanoutWorker {
    db: Arc<Database>,
    cache: Arc<TimelineCache>,
    bus: Arc<EventBus>,
    chunk_size: usize,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
}

impl FanoutWorker {
    pub fn new(state: &SharedState, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            db: state.db.clone(),
            cache: state.cache.clone(),
            bus: state.bus.clone(),
            chunk_size: state.config.fanout_batch_size.max(1),
            concurrency: state.config.worker_concurrency.max(1),
            shutdown,
        }
    }

    /// Run until shutdown: stop pulling new batches, finish the one in
    /// hand, exit. Anything left unacked returns to the queue after the
    /// visibility timeout.
    #[instrument(name = "fanout-worker", skip(self))]
    pub async fn run(self) {
        info!(
            target: LOG_TARGET,
            chunk_size = self.chunk_size,
            concurrency = self.concurrency,
            "Starting fan-out worker"
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                _ = shutdown.changed() => continue,
                res = self.bus.receive(RECEIVE_BATCH, RECEIVE_WAIT) => match res {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Receive failed, backing off");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                        }
                        continue;
                    }
                },
            };

            if batch.is_empty() {
                continue;
            }

            debug!(target: LOG_TARGET, count = batch.len(), "Processing batch");
            futures::stream::iter(batch)
                .for_each_concurrent(self.concurrency, |message| self.process_message(message))
                .await;
        }

        info!(target: LOG_TARGET, "Fan-out worker stopped");
    }

    async fn process_message(&self, message: Message) {
        let event: FeedEvent = match serde_json::from_str(&message.body) {
            Ok(event) => event,
            Err(err) => {
                // Poison messages must not stall the queue.
                error!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    receive_count = message.receive_count,
                    "Dropping malformed event payload"
                );
                self.ack(message.receipt);
                return;
            }
        };

        let FeedEvent::PostCreated {
            post_id,
            author_id,
            timestamp,
            ..
        } = event;

        match self.fan_out(post_id, author_id, timestamp).await {
            Ok(Outcome::Delivered { followers }) => {
                info!(target: LOG_TARGET, %post_id, %author_id, followers, "Fan-out complete");
                self.ack(message.receipt);
            }
            Ok(Outcome::SkippedCelebrity) => {
                // Flipped to celebrity since emit; readers pull instead.
                info!(target: LOG_TARGET, %post_id, %author_id, "Author is a celebrity now, skipping fan-out");
                self.ack(message.receipt);
            }
            Ok(Outcome::SkippedMissingAuthor) => {
                warn!(target: LOG_TARGET, %post_id, %author_id, "Author gone, skipping fan-out");
                self.ack(message.receipt);
            }
            Err(err) => {
                // No ack: the visibility timeout redelivers, and re-adding
                // already-written entries is a no-op.
                warn!(
                    target: LOG_TARGET,
                    %post_id,
                    %author_id,
                    err = %err.fmt_compact(),
                    "Fan-out failed, leaving message for redelivery"
                );
            }
        }
    }

    async fn fan_out(
        &self,
        post_id: PostId,
        author_id: UserId,
        score: Timestamp,
    ) -> Result<Outcome, FanoutError> {
        let Some(author) = self.db.get_user(author_id).await? else {
            return Ok(Outcome::SkippedMissingAuthor);
        };
        if author.is_celebrity {
            return Ok(Outcome::SkippedCelebrity);
        }

        // The author's own timeline gets the post too.
        self.cache.add(author_id, post_id, score)?;

        let mut followers = 0;
        let mut cursor = None;
        loop {
            let (chunk, next) = self
                .db
                .followers_page(author_id, cursor, self.chunk_size)
                .await?;
            for follower in chunk {
                self.cache.add(follower, post_id, score)?;
                followers += 1;
            }

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(Outcome::Delivered { followers })
    }

    fn ack(&self, receipt: Receipt) {
        if let Err(err) = self.bus.ack(receipt) {
            // Stale receipt: the message outlived its visibility timeout and
            // will be processed again; idempotence absorbs it.
            warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Ack failed");
        }
    }
}
