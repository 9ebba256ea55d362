//! Bounded histories kept for the live consumer.
//!
//! - `BoundedBuffer`: fixed-capacity FIFO, oldest entry evicted first
//! - `LogEntry`: timestamped human-readable event line
//! - `RawMessage`: a decoded transport envelope (topic, payload, arrival time)
//!
//! Snapshots are copies, so a renderer holding one never observes a
//! half-evicted buffer.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Default capacity of the session event log.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Default capacity of the raw message store.
pub const DEFAULT_RAW_CAPACITY: usize = 20;

/// Fixed-capacity ring buffer with strict FIFO eviction.
#[derive(Clone, Debug)]
pub struct BoundedBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedBuffer<T> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one first when full.
    pub fn append(&mut self, entry: T) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    /// Copy of the contents, most recent last.
    pub fn snapshot(&self) -> Vec<T> {
        self.buffer.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// One line of the session event log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// A transport message that decoded successfully.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawMessage {
    pub timestamp: DateTime<Local>,
    pub topic: String,
    pub payload: String,
}

pub type BoundedLog = BoundedBuffer<LogEntry>;
pub type RawMessageStore = BoundedBuffer<RawMessage>;
