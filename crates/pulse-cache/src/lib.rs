use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use pulse_core::{PostId, Timestamp, UserId};
use snafu::Snafu;
use tracing::debug;

const LOG_TARGET: &str = "pulse::cache";

#[derive(Debug, Snafu)]
pub enum CacheError {
    #[snafu(display("Timeline cache is unavailable"))]
    Unavailable,
}
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// One cached timeline entry: a post id scored by the post's `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub post_id: PostId,
    pub score: Timestamp,
}

/// A single owner's cached timeline.
///
/// `by_score` carries the eviction/read order; `index` enforces uniqueness
/// by post id and makes repeated adds of the same entry a no-op.
#[derive(Debug, Default)]
struct OwnerTimeline {
    by_score: BTreeSet<(Timestamp, PostId)>,
    index: HashMap<PostId, Timestamp>,
}

impl OwnerTimeline {
    fn insert(&mut self, post_id: PostId, score: Timestamp) {
        match self.index.insert(post_id, score) {
            Some(prev) if prev == score => return,
            Some(prev) => {
                self.by_score.remove(&(prev, post_id));
            }
            None => {}
        }
        self.by_score.insert((score, post_id));
    }

    fn trim(&mut self, cap: usize) {
        while cap < self.by_score.len() {
            let Some(&(score, post_id)) = self.by_score.iter().next() else {
                break;
            };
            self.by_score.remove(&(score, post_id));
            self.index.remove(&post_id);
        }
    }
}

/// Per-user bounded timelines of `(post_id, score)`, the push half of the
/// hybrid feed.
///
/// Everything here is derived state: any timeline can be dropped and rebuilt
/// from the durable store. Each batch of writes to an owner happens under one
/// lock acquisition, so the size cap and post-id uniqueness hold under
/// concurrent fan-out workers.
#[derive(Debug)]
pub struct TimelineCache {
    timelines: Mutex<HashMap<UserId, OwnerTimeline>>,
    cap: usize,
    available: AtomicBool,
}

impl TimelineCache {
    pub fn new(cap: usize) -> Self {
        Self {
            timelines: Mutex::new(HashMap::new()),
            cap,
            available: AtomicBool::new(true),
        }
    }

    /// Liveness probe; never fails.
    pub fn available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Administratively raise or lower the cache. While lowered, every
    /// operation fails with [`CacheError::Unavailable`] and readers are
    /// expected to fall back to the durable store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
        debug!(target: LOG_TARGET, available, "Cache availability changed");
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available() {
            Ok(())
        } else {
            UnavailableSnafu.fail()
        }
    }

    /// Insert or update one entry, then trim the owner's timeline to the
    /// highest-scored `cap` entries. Re-adding an existing `(post_id, score)`
    /// pair changes nothing.
    pub fn add(&self, owner: UserId, post_id: PostId, score: Timestamp) -> CacheResult<()> {
        self.add_many(owner, &[TimelineEntry { post_id, score }])
    }

    /// Bulk [`Self::add`]; the whole batch is applied and trimmed under one
    /// lock acquisition.
    pub fn add_many(&self, owner: UserId, entries: &[TimelineEntry]) -> CacheResult<()> {
        self.check_available()?;

        let mut timelines = self.timelines.lock().expect("locking failed");
        let timeline = timelines.entry(owner).or_default();
        for entry in entries {
            timeline.insert(entry.post_id, entry.score);
        }
        timeline.trim(self.cap);
        Ok(())
    }

    /// Read a rank range of the owner's timeline, highest score first; equal
    /// scores order by higher post id first.
    ///
    /// Returns `None` when the owner has no cached timeline at all (never
    /// built, or invalidated) — the signal for readers to take the fallback
    /// path. An existing-but-empty timeline returns `Some(vec![])`.
    pub fn range(
        &self,
        owner: UserId,
        offset: usize,
        limit: usize,
    ) -> CacheResult<Option<Vec<TimelineEntry>>> {
        self.check_available()?;

        let timelines = self.timelines.lock().expect("locking failed");
        let Some(timeline) = timelines.get(&owner) else {
            return Ok(None);
        };

        Ok(Some(
            timeline
                .by_score
                .iter()
                .rev()
                .skip(offset)
                .take(limit)
                .map(|&(score, post_id)| TimelineEntry { post_id, score })
                .collect(),
        ))
    }

    /// Drop the owner's entire timeline; it will be rebuilt lazily.
    pub fn invalidate(&self, owner: UserId) -> CacheResult<()> {
        self.check_available()?;

        self.timelines
            .lock()
            .expect("locking failed")
            .remove(&owner);
        Ok(())
    }

    /// Best-effort removal of a post from every cached timeline.
    ///
    /// Owners are visited one short critical section at a time, so fan-out
    /// writes interleave freely with the sweep. Returns how many timelines
    /// were touched.
    pub fn remove_post_everywhere(&self, post_id: PostId) -> CacheResult<usize> {
        self.check_available()?;

        let owners: Vec<UserId> = {
            let timelines = self.timelines.lock().expect("locking failed");
            timelines.keys().copied().collect()
        };

        let mut removed = 0;
        for owner in owners {
            let mut timelines = self.timelines.lock().expect("locking failed");
            if let Some(timeline) = timelines.get_mut(&owner) {
                if let Some(score) = timeline.index.remove(&post_id) {
                    timeline.by_score.remove(&(score, post_id));
                    removed += 1;
                }
            }
        }

        debug!(target: LOG_TARGET, %post_id, removed, "Removed post from cached timelines");
        Ok(removed)
    }
}
