//! Coalesces pushed entries into one store merge per quiet period.

use std::time::Duration;

use crate::logscope_core::{LogEntry, Scheduler, TimerId};
use crate::logscope_store::{EntryStore, MergeReport};

pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Batcher {
    pending: Vec<LogEntry>,
    armed: Option<TimerId>,
    delay: Duration,
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_DELAY)
    }
}

impl Batcher {
    pub fn new(delay: Duration) -> Self {
        Self { pending: Vec::new(), armed: None, delay }
    }

    /// Buffers `entry`. The first push of an idle period arms a single timer;
    /// later pushes join that batch. Returns `true` when a timer was armed.
    pub fn push<S: Scheduler + ?Sized>(&mut self, entry: LogEntry, scheduler: &mut S) -> bool {
        self.pending.push(entry);
        if self.armed.is_some() {
            return false;
        }
        self.armed = Some(scheduler.schedule_once(self.delay));
        true
    }

    /// Merges the whole buffer if `timer` is the armed one.
    pub fn flush(&mut self, timer: TimerId, store: &mut EntryStore, at_top: bool) -> Option<MergeReport> {
        if self.armed != Some(timer) {
            return None;
        }
        self.armed = None;
        let batch = std::mem::take(&mut self.pending);
        Some(store.merge(batch, at_top))
    }

    /// Cancels the armed timer and drops buffered entries.
    pub fn discard<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) -> usize {
        if let Some(timer) = self.armed.take() {
            scheduler.cancel(timer);
        }
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn owns(&self, timer: TimerId) -> bool {
        self.armed == Some(timer)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
