//! Bounded per-user queue for messages sent while the user is offline.
//!
//! Full queues drop their oldest entry. Entries may carry a time-to-live and
//! are skipped on drain once expired.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Queued<T> {
    item: T,
    expires_at: Option<Instant>,
}

impl<T> Queued<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
pub struct OfflineQueue<T> {
    queue: VecDeque<Queued<T>>,
    max_size: usize,
    dropped: u64,
}

impl<T> OfflineQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            dropped: 0,
        }
    }

    /// Append `item`. Returns the entry evicted to make room, if any.
    pub fn enqueue(&mut self, item: T, ttl: Option<Duration>) -> Option<T> {
        if self.max_size == 0 {
            self.dropped += 1;
            return Some(item);
        }
        let evicted = if self.queue.len() >= self.max_size {
            self.dropped += 1;
            self.queue.pop_front().map(|q| q.item)
        } else {
            None
        };
        // A TTL too large to represent never expires.
        self.queue.push_back(Queued {
            item,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        });
        evicted
    }

    /// The oldest unexpired entry, left in place. Expired entries ahead of
    /// it are dropped.
    pub fn front(&mut self) -> Option<&T> {
        let now = Instant::now();
        while self.queue.front().is_some_and(|q| q.is_expired(now)) {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.front().map(|q| &q.item)
    }

    /// Remove and return the oldest unexpired entry.
    pub fn pop_front(&mut self) -> Option<T> {
        self.front()?;
        self.queue.pop_front().map(|q| q.item)
    }

    /// Take every unexpired entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let now = Instant::now();
        let mut expired = 0;
        let items = self
            .queue
            .drain(..)
            .filter_map(|q| {
                if q.is_expired(now) {
                    expired += 1;
                    None
                } else {
                    Some(q.item)
                }
            })
            .collect();
        self.dropped += expired;
        items
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.queue.len();
        self.queue.retain(|q| !q.is_expired(now));
        let removed = before - self.queue.len();
        self.dropped += removed as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Entries lost to overflow or expiry since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
