//! Counters shared between the manager and its reader threads.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of the pipe counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipeStats {
    /// Total bytes forwarded to the sink
    pub bytes_received: u64,
    /// Number of data chunks forwarded to the sink
    pub chunks_received: u64,
    /// Successful opens
    pub connections_opened: u64,
    /// Opens that ended in an error event
    pub open_failures: u64,
    /// Completed close sequences
    pub teardowns: u64,
    /// Readers left running after the join timeout
    pub abandoned_readers: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
    connections_opened: AtomicU64,
    open_failures: AtomicU64,
    teardowns: AtomicU64,
    abandoned_readers: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_chunk(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned_readers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipeStats {
        PipeStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
            abandoned_readers: self.abandoned_readers.load(Ordering::Relaxed),
        }
    }
}
