//! Channel metrics
//!
//! Keeps a snapshot-able set of counters for one session channel and mirrors
//! them into the `metrics` facade so an installed recorder can export them.

use chrono::{DateTime, Utc};

/// Counters for one session channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub tasks_queued: u64,
    pub orphan_frames: u64,
    pub server_errors: u64,
    pub decode_failures: u64,
    pub expired_requests: u64,
    pub closed_sends: u64,
    pub pending: usize,
    pub queued: usize,
    pub opened_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ChannelStats {
    pub fn record_sent(&mut self) {
        self.frames_sent += 1;
        metrics::increment_counter!("toyz_frames_sent");
    }

    pub fn record_received(&mut self) {
        self.frames_received += 1;
        metrics::increment_counter!("toyz_frames_received");
    }

    pub fn record_queued(&mut self) {
        self.tasks_queued += 1;
        metrics::increment_counter!("toyz_tasks_queued");
    }

    pub fn record_orphan(&mut self) {
        self.orphan_frames += 1;
        metrics::increment_counter!("toyz_orphan_frames");
    }

    pub fn record_server_error(&mut self) {
        self.server_errors += 1;
        metrics::increment_counter!("toyz_server_errors");
    }

    pub fn record_decode_failure(&mut self) {
        self.decode_failures += 1;
        metrics::increment_counter!("toyz_decode_failures");
    }

    pub fn record_expired(&mut self, count: usize) {
        self.expired_requests += count as u64;
        metrics::counter!("toyz_expired_requests", count as u64);
    }

    pub fn record_closed_send(&mut self) {
        self.closed_sends += 1;
        metrics::increment_counter!("toyz_closed_sends");
    }

    /// Refresh the table/queue gauges
    pub fn set_depths(&mut self, pending: usize, queued: usize) {
        self.pending = pending;
        self.queued = queued;
        metrics::gauge!("toyz_pending_requests", pending as f64);
        metrics::gauge!("toyz_queued_tasks", queued as f64);
    }

    /// Seconds between transport open and session ready, once both happened
    pub fn handshake_secs(&self) -> Option<f64> {
        match (self.opened_at, self.ready_at) {
            (Some(opened), Some(ready)) => {
                Some((ready - opened).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}
