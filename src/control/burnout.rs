//! Candidate host rotation with temporary burn-out.
//!
//! A polled host is "burned" for a fixed interval so that a failing node is
//! not retried in a tight loop. Burned hosts come back at the end of the
//! available list once their interval has elapsed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rotating candidate list.
#[derive(Debug, Clone)]
pub struct BurnoutList<T> {
    burn_time: Duration,
    available: VecDeque<T>,
    burned: VecDeque<(Instant, T)>,
}

impl<T: Clone> BurnoutList<T> {
    pub fn new(burn_time: Duration) -> Self {
        Self {
            burn_time,
            available: VecDeque::new(),
            burned: VecDeque::new(),
        }
    }

    pub fn with_entries(burn_time: Duration, entries: impl IntoIterator<Item = T>) -> Self {
        let mut list = Self::new(burn_time);
        list.set(entries);
        list
    }

    /// Replace the available list and forget all burn state.
    pub fn set(&mut self, entries: impl IntoIterator<Item = T>) {
        self.available = entries.into_iter().collect();
        self.burned.clear();
    }

    /// Take the next candidate, burning it until `now + burn_time`.
    pub fn poll(&mut self) -> Option<T> {
        self.poll_at(Instant::now())
    }

    /// [`poll`](Self::poll) with an explicit clock.
    pub fn poll_at(&mut self, now: Instant) -> Option<T> {
        // Burn expiries are pushed in poll order, so the front always expires first.
        while let Some((until, _)) = self.burned.front() {
            if *until > now {
                break;
            }
            if let Some((_, entry)) = self.burned.pop_front() {
                self.available.push_back(entry);
            }
        }

        let entry = self.available.pop_front()?;
        self.burned.push_back((now + self.burn_time, entry.clone()));
        Some(entry)
    }

    /// Entries available or burned.
    pub fn len(&self) -> usize {
        self.available.len() + self.burned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn burn_time(&self) -> Duration {
        self.burn_time
    }
}
