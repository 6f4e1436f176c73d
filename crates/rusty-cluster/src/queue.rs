//! Delay-aware FIFO queue.

use std::collections::VecDeque;

use tokio::time::Instant;

struct Entry<T> {
    item: T,
    not_before: Option<Instant>,
}

/// Result of [`JobQueue::shift`].
#[derive(Debug, PartialEq, Eq)]
pub enum Shift<T> {
    /// The first entry that is eligible now.
    Ready(T),
    /// Entries exist but all are delayed; the earliest becomes eligible at `until`.
    Delayed { until: Instant },
    Empty,
}

/// FIFO queue whose entries may carry a "not before" time.
///
/// A delayed entry never blocks eligible entries queued behind it.
pub struct JobQueue<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, item: T, not_before: Option<Instant>) {
        self.entries.push_back(Entry { item, not_before });
    }

    /// Number of entries, delayed ones included.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry regardless of delay.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|e| e.item).collect()
    }

    pub fn shift(&mut self) -> Shift<T> {
        self.shift_at(Instant::now())
    }

    /// Remove the first entry eligible at `now`.
    pub fn shift_at(&mut self, now: Instant) -> Shift<T> {
        let eligible = self
            .entries
            .iter()
            .position(|e| e.not_before.is_none_or(|at| at <= now));
        if let Some(entry) = eligible.and_then(|i| self.entries.remove(i)) {
            return Shift::Ready(entry.item);
        }
        match self.entries.iter().filter_map(|e| e.not_before).min() {
            Some(until) => Shift::Delayed { until },
            None => Shift::Empty,
        }
    }
}
