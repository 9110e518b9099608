//! Pool and dispatch counters.
//!
//! All counters use relaxed ordering. They are approximate gauges read by the
//! operator API, so strict ordering isn't needed.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct PoolMetrics {
    /// Tasks dispatched since startup (success or failure).
    pub total_tasks: AtomicU64,
    /// Cumulative dispatch time across all tasks (milliseconds).
    pub total_duration_ms: AtomicU64,
    /// Tasks whose verdict was `is_valid: true`.
    pub valid_verdicts: AtomicU64,
    /// Tasks that ended in an error rather than a verdict.
    pub failed_tasks: AtomicU64,
    pub timeouts: AtomicU64,
    /// Current number of live sandboxes.
    pub active_sandboxes: AtomicU64,
    /// Peak concurrent sandboxes observed.
    pub peak_sandboxes: AtomicU64,
    pub sandboxes_created: AtomicU64,
    pub creation_failures: AtomicU64,
    /// Requests served by an already pooled sandbox.
    pub reused: AtomicU64,
    /// Sandboxes evicted to make room for another type.
    pub evictions: AtomicU64,
    pub restarts: AtomicU64,
    /// Sandboxes reaped due to idle timeout.
    pub reaped_idle: AtomicU64,
    /// Leftover sandboxes removed by startup reconciliation.
    pub reconciled: AtomicU64,
    pub attestations_trusted: AtomicU64,
    pub attestations_rejected: AtomicU64,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMetrics {
    pub const fn new() -> Self {
        Self {
            total_tasks: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            valid_verdicts: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            active_sandboxes: AtomicU64::new(0),
            peak_sandboxes: AtomicU64::new(0),
            sandboxes_created: AtomicU64::new(0),
            creation_failures: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            reaped_idle: AtomicU64::new(0),
            reconciled: AtomicU64::new(0),
            attestations_trusted: AtomicU64::new(0),
            attestations_rejected: AtomicU64::new(0),
        }
    }

    /// Record a task that produced a verdict.
    pub fn record_task(&self, duration_ms: u64, valid: bool) {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if valid {
            self.valid_verdicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, duration_ms: u64, timed_out: bool) {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        let current = self.active_sandboxes.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_sandboxes.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_sandbox_removed(&self) {
        let _ = self
            .active_sandboxes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attestation(&self, trusted: bool) {
        if trusted {
            self.attestations_trusted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.attestations_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped_idle(&self) {
        self.reaped_idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciled(&self, count: u64) {
        self.reconciled.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot all metrics as key-value pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let total_tasks = self.total_tasks.load(Ordering::Relaxed);
        let avg_duration_ms = if total_tasks > 0 {
            self.total_duration_ms.load(Ordering::Relaxed) / total_tasks
        } else {
            0
        };

        vec![
            ("total_tasks".into(), total_tasks),
            ("avg_duration_ms".into(), avg_duration_ms),
            (
                "valid_verdicts".into(),
                self.valid_verdicts.load(Ordering::Relaxed),
            ),
            (
                "failed_tasks".into(),
                self.failed_tasks.load(Ordering::Relaxed),
            ),
            ("timeouts".into(), self.timeouts.load(Ordering::Relaxed)),
            (
                "active_sandboxes".into(),
                self.active_sandboxes.load(Ordering::Relaxed),
            ),
            (
                "peak_sandboxes".into(),
                self.peak_sandboxes.load(Ordering::Relaxed),
            ),
            (
                "sandboxes_created".into(),
                self.sandboxes_created.load(Ordering::Relaxed),
            ),
            (
                "creation_failures".into(),
                self.creation_failures.load(Ordering::Relaxed),
            ),
            ("reused".into(), self.reused.load(Ordering::Relaxed)),
            ("evictions".into(), self.evictions.load(Ordering::Relaxed)),
            ("restarts".into(), self.restarts.load(Ordering::Relaxed)),
            (
                "reaped_idle".into(),
                self.reaped_idle.load(Ordering::Relaxed),
            ),
            ("reconciled".into(), self.reconciled.load(Ordering::Relaxed)),
            (
                "attestations_trusted".into(),
                self.attestations_trusted.load(Ordering::Relaxed),
            ),
            (
                "attestations_rejected".into(),
                self.attestations_rejected.load(Ordering::Relaxed),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(snapshot: &[(String, u64)], key: &str) -> u64 {
        snapshot
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
            .unwrap()
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let m = PoolMetrics::new();
        m.record_sandbox_created();
        m.record_sandbox_created();
        m.record_sandbox_removed();
        m.record_sandbox_created();
        let snap = m.snapshot();
        assert_eq!(get(&snap, "active_sandboxes"), 2);
        assert_eq!(get(&snap, "peak_sandboxes"), 2);
        assert_eq!(get(&snap, "sandboxes_created"), 3);
    }

    #[test]
    fn removed_saturates_at_zero() {
        let m = PoolMetrics::new();
        m.record_sandbox_removed();
        assert_eq!(get(&m.snapshot(), "active_sandboxes"), 0);
    }

    #[test]
    fn average_duration_includes_failures() {
        let m = PoolMetrics::new();
        m.record_task(100, true);
        m.record_failure(300, true);
        let snap = m.snapshot();
        assert_eq!(get(&snap, "total_tasks"), 2);
        assert_eq!(get(&snap, "avg_duration_ms"), 200);
        assert_eq!(get(&snap, "valid_verdicts"), 1);
        assert_eq!(get(&snap, "timeouts"), 1);
    }
}
