//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Lock-free listener metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free listener metrics
///
/// Counters are plain atomics owned by one listener. Use
/// [`snapshot()`](ServerMetrics::snapshot) for a point-in-time view.
#[derive(Debug)]
pub struct ServerMetrics {
    // Sessions
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    active_sessions: AtomicU64,

    // Traffic
    packets_received: AtomicU64,
    responses_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,

    // Failures
    boundary_timeouts: AtomicU64,
    mid_packet_timeouts: AtomicU64,
    session_errors: AtomicU64,
    handler_failures: AtomicU64,
    accept_errors: AtomicU64,

    // Pool
    workers_spawned: AtomicU64,
    workers_reused: AtomicU64,

    total_session_duration_ns: AtomicU64,
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            responses_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            boundary_timeouts: AtomicU64::new(0),
            mid_packet_timeouts: AtomicU64::new(0),
            session_errors: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            workers_spawned: AtomicU64::new(0),
            workers_reused: AtomicU64::new(0),
            total_session_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Session tracking

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished session, its traffic and whether it failed
    pub fn session_closed(&self, duration: Duration, bytes_read: u64, bytes_written: u64, failed: bool) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_read, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_written, Ordering::Relaxed);
        self.total_session_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        if failed {
            self.session_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn total_sessions(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    // Traffic

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Failures

    pub fn boundary_timeout(&self) {
        self.boundary_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mid_packet_timeout(&self) {
        self.mid_packet_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Pool

    pub fn worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_reused(&self) {
        self.workers_reused.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    ///
    /// Counters are read one at a time, so a snapshot taken under load may mix
    /// values from slightly different instants.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            boundary_timeouts: self.boundary_timeouts.load(Ordering::Relaxed),
            mid_packet_timeouts: self.mid_packet_timeouts.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_reused: self.workers_reused.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_session_duration: self.average_session_duration(),
        }
    }

    fn average_session_duration(&self) -> Duration {
        let closed = self.sessions_closed.load(Ordering::Relaxed);
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_session_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / closed)
    }
}

/// A snapshot of listener metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub active_sessions: u64,
    pub packets_received: u64,
    pub responses_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Idle deadlines that passed with no packet started
    pub boundary_timeouts: u64,
    /// Packet deadlines that passed with a packet half read
    pub mid_packet_timeouts: u64,
    /// Sessions whose outcome counts as an error
    pub session_errors: u64,
    pub handler_failures: u64,
    pub accept_errors: u64,
    pub workers_spawned: u64,
    pub workers_reused: u64,
    pub uptime: Duration,
    pub avg_session_duration: Duration,
}

impl MetricsSnapshot {
    /// Packets per second over the listener lifetime
    pub fn packets_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.packets_received as f64 / self.uptime.as_secs_f64()
    }

    /// Total timeouts of both classes
    pub fn total_timeouts(&self) -> u64 {
        self.boundary_timeouts + self.mid_packet_timeouts
    }

    /// Fraction of finished sessions that ended in error
    pub fn error_ratio(&self) -> f64 {
        if self.sessions_closed == 0 {
            return 0.0;
        }
        self.session_errors as f64 / self.sessions_closed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_session_tracking() {
        let metrics = ServerMetrics::new();
        assert_eq!(metrics.active_sessions(), 0);

        metrics.session_opened();
        metrics.session_opened();
        assert_eq!(metrics.active_sessions(), 2);
        assert_eq!(metrics.total_sessions(), 2);

        metrics.session_closed(Duration::from_millis(10), 40, 8, false);
        metrics.session_closed(Duration::from_millis(30), 2, 0, true);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.sessions_closed, 2);
        assert_eq!(snapshot.bytes_received, 42);
        assert_eq!(snapshot.bytes_sent, 8);
        assert_eq!(snapshot.session_errors, 1);
        assert_eq!(snapshot.avg_session_duration, Duration::from_millis(20));
        assert_eq!(snapshot.error_ratio(), 0.5);
    }

    #[test]
    fn test_failure_tracking() {
        let metrics = ServerMetrics::new();
        metrics.boundary_timeout();
        metrics.mid_packet_timeout();
        metrics.mid_packet_timeout();
        metrics.handler_failure();
        metrics.accept_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_timeouts(), 3);
        assert_eq!(snapshot.handler_failures, 1);
        assert_eq!(snapshot.accept_errors, 1);
    }

    #[test]
    fn test_pool_tracking() {
        let metrics = ServerMetrics::new();
        metrics.worker_spawned();
        metrics.worker_reused();
        metrics.worker_reused();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.workers_spawned, 1);
        assert_eq!(snapshot.workers_reused, 2);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = std::sync::Arc::new(ServerMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let metrics = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    metrics.session_opened();
                    metrics.packet_received();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.total_sessions(), 1000);
        assert_eq!(metrics.snapshot().packets_received, 1000);
    }
}
