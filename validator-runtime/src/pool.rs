//! Pool manager: the admission-controlled mapping from validator type to a
//! live sandbox.
//!
//! Invariants:
//! - at most one sandbox per validator type
//! - `entries + reserved <= max_validators` at every point, where a
//!   reservation is a slot held by a creation or a teardown in progress
//! - when full, exactly one victim is evicted: the entry with the smallest
//!   `(created_at, insertion order)`
//!
//! Every read or write of the entry map happens under the `state` lock, which
//! is never held across an await. Same-type flows are serialized by a
//! per-type async lock so concurrent requests converge on one sandbox.
//!
//! Callers hold a [`SandboxLease`] while dispatching. Eviction removes the
//! entry immediately but waits (bounded) for outstanding leases to drop
//! before stopping the sandbox. Until that teardown finishes the type is
//! marked as retiring and no replacement is created for it, since the
//! replacement would reuse the sandbox name.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{PoolConfig, SandboxSpec};
use crate::error::{Result, SandboxError};
use crate::lifecycle::LifecycleController;
use crate::metrics::PoolMetrics;
use crate::provider::SandboxProvider;
use crate::sandbox::{Sandbox, SandboxStatus, ValidatorType};

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn acquire(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no lease is outstanding. Returns `false` on timeout.
    async fn drained(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.current() == 0;
            }
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A pooled sandbox checked out for one dispatch.
pub struct SandboxLease {
    sandbox: Sandbox,
    _guard: InFlightGuard,
}

impl SandboxLease {
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }
}

impl Deref for SandboxLease {
    type Target = Sandbox;

    fn deref(&self) -> &Sandbox {
        &self.sandbox
    }
}

struct PoolEntry {
    sandbox: Sandbox,
    seq: u64,
    inflight: Arc<InFlight>,
    last_used: Instant,
}

impl PoolEntry {
    fn lease(&mut self) -> SandboxLease {
        self.last_used = Instant::now();
        SandboxLease {
            sandbox: self.sandbox.clone(),
            _guard: self.inflight.acquire(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ValidatorType, PoolEntry>,
    /// Types whose removed sandbox has not finished tearing down.
    retiring: HashSet<ValidatorType>,
    reserved: usize,
    next_seq: u64,
    shutting_down: bool,
}

impl PoolState {
    /// Remove an entry, marking its type as retiring until [`PoolManager::retire`]
    /// completes.
    fn detach(&mut self, validator_type: &ValidatorType) -> Option<PoolEntry> {
        let entry = self.entries.remove(validator_type)?;
        self.retiring.insert(validator_type.clone());
        Some(entry)
    }
}

/// Holds the per-type serialization lock. Drops the map slot once nobody
/// else is waiting on it.
struct TypeSerial<'a> {
    pool: &'a PoolManager,
    validator_type: ValidatorType,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TypeSerial<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .pool
            .type_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.validator_type)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.validator_type);
        }
    }
}

/// A capacity slot held outside the entry map. Released on drop.
struct Reservation<'a> {
    pool: &'a PoolManager,
    active: bool,
}

impl<'a> Reservation<'a> {
    /// Caller must already have incremented `reserved` under the state lock.
    fn held(pool: &'a PoolManager) -> Self {
        Self { pool, active: true }
    }

    /// Convert the slot into a map entry. Called with the state lock held.
    fn commit(mut self, state: &mut PoolState) {
        state.reserved = state.reserved.saturating_sub(1);
        self.active = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            {
                let mut state = self.pool.state();
                state.reserved = state.reserved.saturating_sub(1);
            }
            self.pool.slot_freed.notify_waiters();
        }
    }
}

/// Point-in-time view of one pool entry.
#[derive(Clone, Debug, Serialize)]
pub struct PoolEntryView {
    #[serde(flatten)]
    pub sandbox: Sandbox,
    pub in_flight: usize,
    pub idle_secs: u64,
}

/// Outcome of a shutdown sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: usize,
    /// `(sandbox name, error)` for every sandbox that could not be removed.
    pub failures: Vec<(String, String)>,
}

pub struct PoolManager {
    config: PoolConfig,
    lifecycle: LifecycleController,
    metrics: Arc<PoolMetrics>,
    state: Mutex<PoolState>,
    type_locks: Mutex<HashMap<ValidatorType, Arc<AsyncMutex<()>>>>,
    slot_freed: Notify,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn SandboxProvider>,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        let lifecycle = LifecycleController::new(provider, config.health.clone());
        Self {
            config,
            lifecycle,
            metrics,
            state: Mutex::new(PoolState::default()),
            type_locks: Mutex::new(HashMap::new()),
            slot_freed: Notify::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn capacity(&self) -> usize {
        self.config.max_validators.max(1)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn serialize(&self, validator_type: &ValidatorType) -> TypeSerial<'_> {
        let lock = self
            .type_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(validator_type.clone())
            .or_default()
            .clone();
        TypeSerial {
            pool: self,
            validator_type: validator_type.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_type_locks(&self) -> usize {
        self.type_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Lease on the pooled sandbox for `validator_type` without creating,
    /// restarting or evicting anything.
    pub fn lease_existing(&self, validator_type: &ValidatorType) -> Option<SandboxLease> {
        self.state()
            .entries
            .get_mut(validator_type)
            .map(PoolEntry::lease)
    }

    /// Return a lease on the running sandbox for `validator_type`, creating
    /// (and evicting the oldest entry if full) or restarting as needed.
    pub async fn get_or_create(&self, validator_type: &ValidatorType) -> Result<SandboxLease> {
        let _serial = self.serialize(validator_type).await;
        let spec = self.config.sandbox_spec(validator_type);

        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (pooled, retiring) = {
                let state = self.state();
                if state.shutting_down {
                    return Err(SandboxError::Shutdown);
                }
                (
                    state
                        .entries
                        .get(validator_type)
                        .map(|entry| (entry.sandbox.clone(), entry.seq)),
                    state.retiring.contains(validator_type),
                )
            };

            let Some((sandbox, seq)) = pooled else {
                if retiring {
                    debug!("pool: waiting for previous {validator_type} sandbox to be removed");
                    notified.await;
                    continue;
                }
                return self.admit(validator_type, &spec, None).await;
            };

            let alive = sandbox.is_running()
                && matches!(
                    self.lifecycle.provider().is_running(&sandbox.handle).await,
                    Ok(true)
                );
            if alive {
                let lease = {
                    let mut state = self.state();
                    state
                        .entries
                        .get_mut(validator_type)
                        .filter(|entry| entry.seq == seq)
                        .map(PoolEntry::lease)
                };
                if let Some(lease) = lease {
                    self.metrics.record_reuse();
                    debug!("pool: reusing {} for {validator_type}", lease.name);
                    return Ok(lease);
                }
                // Evicted between lookup and lease; look again.
                continue;
            }

            if let Some(lease) = self
                .restart_in_place(validator_type, sandbox, seq, &spec)
                .await?
            {
                return Ok(lease);
            }
        }
    }

    /// Restart a pooled sandbox that is no longer running. On failure the
    /// entry is torn down and the type recreated in the freed slot.
    /// `Ok(None)` means the entry vanished meanwhile and the caller should
    /// look again.
    async fn restart_in_place(
        &self,
        validator_type: &ValidatorType,
        mut sandbox: Sandbox,
        seq: u64,
        spec: &SandboxSpec,
    ) -> Result<Option<SandboxLease>> {
        self.set_status(validator_type, seq, SandboxStatus::Creating);

        match self.lifecycle.restart(&mut sandbox, spec).await {
            Ok(()) => {
                self.metrics.record_restart();
                let mut state = self.state();
                let Some(entry) = state
                    .entries
                    .get_mut(validator_type)
                    .filter(|entry| entry.seq == seq)
                else {
                    return Ok(None);
                };
                entry.sandbox = sandbox;
                info!("pool: restarted {} in place", entry.sandbox.name);
                Ok(Some(entry.lease()))
            }
            Err(err) => {
                warn!(
                    "pool: restart of {} failed, recreating: {err}",
                    sandbox.name
                );
                let Some((entry, reservation)) = self.take_entry(validator_type, Some(seq)) else {
                    return Ok(None);
                };
                if let Err(err) = self.retire(entry).await {
                    warn!("pool: teardown after failed restart: {err}");
                }
                self.admit(validator_type, spec, Some(reservation))
                    .await
                    .map(Some)
            }
        }
    }

    /// Create a new sandbox in a reserved slot and register it.
    async fn admit(
        &self,
        validator_type: &ValidatorType,
        spec: &SandboxSpec,
        reservation: Option<Reservation<'_>>,
    ) -> Result<SandboxLease> {
        let reservation = match reservation {
            Some(reservation) => reservation,
            None => self.reserve(validator_type).await?,
        };

        let sandbox = match self.lifecycle.create(validator_type, spec).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                self.metrics.record_creation_failure();
                warn!("pool: failed to create sandbox for {validator_type}: {err}");
                return Err(err);
            }
        };

        let max = self.capacity();
        let registered = {
            let mut state = self.state();
            reservation.commit(&mut state);
            if state.shutting_down {
                Err((SandboxError::Shutdown, sandbox))
            } else if state.entries.len() >= max {
                let err = SandboxError::CapacityInvariantViolation {
                    live: state.entries.len() + 1,
                    max,
                };
                error!("pool: {err}");
                Err((err, sandbox))
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let mut entry = PoolEntry {
                    sandbox,
                    seq,
                    inflight: Arc::new(InFlight::default()),
                    last_used: Instant::now(),
                };
                let lease = entry.lease();
                state.entries.insert(validator_type.clone(), entry);
                self.metrics.record_sandbox_created();
                info!(
                    "pool: admitted {} ({}/{max} live)",
                    lease.name,
                    state.entries.len()
                );
                Ok(lease)
            }
        };

        // Waiters blocked on a full set of reservations can now evict.
        self.slot_freed.notify_waiters();

        let (err, sandbox) = match registered {
            Ok(lease) => return Ok(lease),
            Err(rejected) => rejected,
        };
        // Never registered; tear it down so it does not leak.
        if let Err(cleanup) = self.lifecycle.teardown(&sandbox).await {
            warn!("pool: cleanup of unregistered {} failed: {cleanup}", sandbox.name);
        }
        Err(err)
    }

    /// Reserve a slot, evicting the oldest entry if the pool is full. Waits
    /// when every slot is held by an in-progress creation or teardown.
    async fn reserve(&self, validator_type: &ValidatorType) -> Result<Reservation<'_>> {
        let max = self.capacity();
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let victim = {
                let mut state = self.state();
                if state.shutting_down {
                    return Err(SandboxError::Shutdown);
                }
                if state.entries.len() + state.reserved < max {
                    state.reserved += 1;
                    return Ok(Reservation::held(self));
                }
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| (entry.sandbox.created_at, entry.seq))
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        state.reserved += 1;
                        state.detach(&key)
                    }
                    None => None,
                }
            };

            match victim {
                Some(entry) => {
                    let reservation = Reservation::held(self);
                    self.metrics.record_eviction();
                    info!(
                        "pool: evicting {} (created {}) to admit {validator_type}",
                        entry.sandbox.name, entry.sandbox.created_at
                    );
                    if let Err(err) = self.retire(entry).await {
                        warn!("pool: eviction teardown failed: {err}");
                    }
                    return Ok(reservation);
                }
                None => {
                    debug!("pool: all {max} slots reserved; waiting for {validator_type}");
                    notified.await;
                }
            }
        }
    }

    /// Remove an entry from the map while keeping its slot reserved.
    fn take_entry(
        &self,
        validator_type: &ValidatorType,
        seq: Option<u64>,
    ) -> Option<(PoolEntry, Reservation<'_>)> {
        let mut state = self.state();
        let matches = state
            .entries
            .get(validator_type)
            .is_some_and(|entry| seq.is_none_or(|seq| entry.seq == seq));
        if !matches {
            return None;
        }
        let entry = state.detach(validator_type)?;
        state.reserved += 1;
        Some((entry, Reservation::held(self)))
    }

    /// Drain outstanding leases (bounded) then stop and remove the sandbox.
    /// Clears the type's retiring mark whatever the teardown outcome.
    async fn retire(&self, entry: PoolEntry) -> Result<()> {
        if !entry
            .inflight
            .drained(self.config.eviction_drain_timeout)
            .await
        {
            warn!(
                "pool: {} still has {} in-flight calls after drain timeout",
                entry.sandbox.name,
                entry.inflight.current()
            );
        }
        self.metrics.record_sandbox_removed();
        let result = self.lifecycle.teardown(&entry.sandbox).await;
        self.state().retiring.remove(&entry.sandbox.validator_type);
        self.slot_freed.notify_waiters();
        result
    }

    fn set_status(&self, validator_type: &ValidatorType, seq: u64, status: SandboxStatus) {
        let mut state = self.state();
        if let Some(entry) = state
            .entries
            .get_mut(validator_type)
            .filter(|entry| entry.seq == seq)
        {
            entry.sandbox.status = status;
        }
    }

    /// Mark the entry holding sandbox `sandbox_id` unhealthy. Membership is
    /// unchanged; the next `get_or_create` restarts it.
    pub fn mark_unhealthy(&self, validator_type: &ValidatorType, sandbox_id: &str) {
        let mut state = self.state();
        if let Some(entry) = state
            .entries
            .get_mut(validator_type)
            .filter(|entry| entry.sandbox.id == sandbox_id)
        {
            warn!("pool: marking {} unhealthy", entry.sandbox.name);
            entry.sandbox.status = SandboxStatus::Unhealthy;
        }
    }

    /// Evict the sandbox for `validator_type`. Returns `false` if none is pooled.
    pub async fn evict(&self, validator_type: &ValidatorType) -> Result<bool> {
        let _serial = self.serialize(validator_type).await;

        let Some((entry, _reservation)) = self.take_entry(validator_type, None) else {
            return Ok(false);
        };
        info!("pool: evicting {} on request", entry.sandbox.name);
        self.metrics.record_eviction();
        self.retire(entry).await?;
        Ok(true)
    }

    /// Evict entries with no outstanding lease and no use for `idle`.
    pub async fn reap_idle(&self, idle: Duration) -> usize {
        let victims: Vec<PoolEntry> = {
            let mut state = self.state();
            let keys: Vec<ValidatorType> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.inflight.current() == 0 && entry.last_used.elapsed() >= idle
                })
                .map(|(key, _)| key.clone())
                .collect();
            let victims: Vec<PoolEntry> = keys
                .iter()
                .filter_map(|key| state.detach(key))
                .collect();
            state.reserved += victims.len();
            victims
        };

        let reservations: Vec<Reservation<'_>> =
            victims.iter().map(|_| Reservation::held(self)).collect();

        let mut reaped = 0;
        for (entry, _reservation) in victims.into_iter().zip(reservations) {
            info!(
                "pool: reaping {} (idle for {}s)",
                entry.sandbox.name,
                entry.last_used.elapsed().as_secs()
            );
            match self.retire(entry).await {
                Ok(()) => {
                    self.metrics.record_reaped_idle();
                    reaped += 1;
                }
                Err(err) => error!("pool: failed to reap idle sandbox: {err}"),
            }
        }
        reaped
    }

    /// Stop and remove every pooled sandbox. Best effort: a failure is
    /// logged and the sweep continues. The pool admits nothing afterwards.
    pub async fn sweep(&self) -> SweepReport {
        let mut entries: Vec<PoolEntry> = {
            let mut state = self.state();
            state.shutting_down = true;
            let keys: Vec<ValidatorType> = state.entries.keys().cloned().collect();
            keys.iter().filter_map(|key| state.detach(key)).collect()
        };
        self.slot_freed.notify_waiters();
        entries.sort_by_key(|entry| (entry.sandbox.created_at, entry.seq));

        info!("pool: sweeping {} sandboxes", entries.len());
        let mut report = SweepReport::default();
        for entry in entries {
            let name = entry.sandbox.name.clone();
            match self.retire(entry).await {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    error!("pool: failed to remove {name} during sweep: {err}");
                    report.failures.push((name, err.to_string()));
                }
            }
        }
        info!(
            "pool: sweep finished ({} removed, {} failed)",
            report.removed,
            report.failures.len()
        );
        report
    }

    /// Entries ordered oldest first.
    pub fn snapshot(&self) -> Vec<PoolEntryView> {
        let state = self.state();
        let mut views: Vec<(u64, PoolEntryView)> = state
            .entries
            .values()
            .map(|entry| {
                (
                    entry.seq,
                    PoolEntryView {
                        sandbox: entry.sandbox.clone(),
                        in_flight: entry.inflight.current(),
                        idle_secs: entry.last_used.elapsed().as_secs(),
                    },
                )
            })
            .collect();
        views.sort_by_key(|(seq, view)| (view.sandbox.created_at, *seq));
        views.into_iter().map(|(_, view)| view).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckPolicy;
    use crate::provider::mock::MockProvider;
    use crate::sandbox::Endpoint;

    fn test_config(max: usize) -> PoolConfig {
        PoolConfig {
            max_validators: max,
            health: HealthCheckPolicy {
                retries: 2,
                interval: Duration::from_millis(5),
                probe_timeout: Duration::from_millis(100),
            },
            eviction_drain_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        }
    }

    fn pool_with(config: PoolConfig, provider: Arc<MockProvider>) -> Arc<PoolManager> {
        Arc::new(PoolManager::new(
            config,
            provider,
            Arc::new(PoolMetrics::new()),
        ))
    }

    fn mock_provider() -> Arc<MockProvider> {
        Arc::new(MockProvider::new(Endpoint::Exec {
            program: "true".into(),
            args: vec![],
        }))
    }

    fn vt(name: &str) -> ValidatorType {
        ValidatorType::new(name).unwrap()
    }

    #[tokio::test]
    async fn reuse_returns_identical_sandbox() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        let first = pool.get_or_create(&vt("doordash")).await.unwrap();
        let first_id = first.id.clone();
        drop(first);
        let second = pool.get_or_create(&vt("doordash")).await.unwrap();

        assert_eq!(second.id, first_id);
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn full_pool_evicts_oldest_entry() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        for name in ["a", "b", "c"] {
            drop(pool.get_or_create(&vt(name)).await.unwrap());
        }
        // Reusing "a" does not refresh its age.
        drop(pool.get_or_create(&vt("a")).await.unwrap());
        drop(pool.get_or_create(&vt("d")).await.unwrap());

        assert_eq!(pool.len(), 3);
        assert_eq!(provider.live_count(), 3);
        assert_eq!(provider.removed_names(), vec!["a-proof".to_string()]);
        let names: Vec<String> = pool
            .snapshot()
            .into_iter()
            .map(|view| view.sandbox.name)
            .collect();
        assert_eq!(names, vec!["b-proof", "c-proof", "d-proof"]);
    }

    #[tokio::test]
    async fn creation_failure_is_not_registered() {
        let provider = mock_provider();
        let pool = pool_with(test_config(2), provider.clone());

        provider.fail_create.store(true, Ordering::Relaxed);
        let err = pool.get_or_create(&vt("doordash")).await.err().unwrap();
        assert!(matches!(err, SandboxError::Provider(_)));
        assert!(pool.is_empty());

        provider.fail_create.store(false, Ordering::Relaxed);
        pool.get_or_create(&vt("doordash")).await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_same_type_requests_share_one_sandbox() {
        let provider = Arc::new(
            MockProvider::new(Endpoint::Exec {
                program: "true".into(),
                args: vec![],
            })
            .with_create_delay(Duration::from_millis(50)),
        );
        let pool = pool_with(test_config(3), provider.clone());

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let pool = pool.clone();
            set.spawn(async move { pool.get_or_create(&vt("doordash")).await.map(|l| l.id.clone()) });
        }
        let mut ids = Vec::new();
        while let Some(res) = set.join_next().await {
            ids.push(res.unwrap().unwrap());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn concurrent_distinct_types_never_exceed_capacity() {
        let provider = Arc::new(
            MockProvider::new(Endpoint::Exec {
                program: "true".into(),
                args: vec![],
            })
            .with_create_delay(Duration::from_millis(20)),
        );
        let pool = pool_with(test_config(2), provider.clone());

        let mut set = tokio::task::JoinSet::new();
        for i in 0..6 {
            let pool = pool.clone();
            set.spawn(async move { pool.get_or_create(&vt(&format!("type{i}"))).await.map(drop) });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }

        assert_eq!(pool.len(), 2);
        assert_eq!(provider.live_count(), 2);
        let peak = pool.metrics().peak_sandboxes.load(Ordering::Relaxed);
        assert!(peak <= 2, "peak {peak} exceeded capacity");
        assert_eq!(pool.metrics().evictions.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn dead_sandbox_is_restarted_in_place() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        let lease = pool.get_or_create(&vt("doordash")).await.unwrap();
        let (id, handle) = (lease.id.clone(), lease.handle.clone());
        drop(lease);
        provider.kill(&handle);

        let lease = pool.get_or_create(&vt("doordash")).await.unwrap();
        assert_eq!(lease.id, id);
        assert_eq!(lease.status, SandboxStatus::Running);
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 1);
        assert_eq!(provider.start_count.load(Ordering::Relaxed), 2);
        assert_eq!(pool.metrics().restarts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_restart_falls_back_to_recreation() {
        let provider = mock_provider();
        let pool = pool_with(test_config(1), provider.clone());

        let lease = pool.get_or_create(&vt("doordash")).await.unwrap();
        let (id, handle) = (lease.id.clone(), lease.handle.clone());
        drop(lease);
        // Container disappears behind the pool's back; start will fail.
        provider.containers.lock().unwrap().remove(&handle);

        let lease = pool.get_or_create(&vt("doordash")).await.unwrap();
        assert_ne!(lease.id, id);
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 2);
        assert_eq!(pool.len(), 1);
        assert_eq!(provider.live_count(), 1);
    }

    #[tokio::test]
    async fn unhealthy_mark_forces_restart_without_changing_membership() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        let lease = pool.get_or_create(&vt("doordash")).await.unwrap();
        let id = lease.id.clone();
        drop(lease);

        pool.mark_unhealthy(&vt("doordash"), &id);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.snapshot()[0].sandbox.status, SandboxStatus::Unhealthy);

        let lease = pool.get_or_create(&vt("doordash")).await.unwrap();
        assert_eq!(lease.id, id);
        assert_eq!(provider.stop_count.load(Ordering::Relaxed), 1);
        assert_eq!(provider.start_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn eviction_waits_for_in_flight_lease() {
        let provider = mock_provider();
        let pool = pool_with(test_config(1), provider.clone());

        let held = pool.get_or_create(&vt("a")).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_or_create(&vt("b")).await.map(|l| l.name.clone()) })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.remove_count.load(Ordering::Relaxed), 0);
        assert!(!waiter.is_finished());

        drop(held);
        let name = waiter.await.unwrap().unwrap();
        assert_eq!(name, "b-proof");
        assert_eq!(provider.removed_names(), vec!["a-proof".to_string()]);
    }

    #[tokio::test]
    async fn same_type_waits_for_draining_sandbox_before_recreating() {
        let provider = Arc::new(
            MockProvider::new(Endpoint::Exec {
                program: "true".into(),
                args: vec![],
            })
            .with_name_replacement(),
        );
        let pool = pool_with(test_config(3), provider.clone());

        let held = pool.get_or_create(&vt("a")).await.unwrap();
        drop(pool.get_or_create(&vt("b")).await.unwrap());
        drop(pool.get_or_create(&vt("c")).await.unwrap());

        // "d" evicts "a", which drains behind the held lease.
        let newcomer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_or_create(&vt("d")).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let again = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_or_create(&vt("a")).await.map(|l| l.id.clone()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(provider.is_running(&held.handle).await.unwrap());
        assert!(provider.removed_names().is_empty());
        assert!(!again.is_finished());

        let old_id = held.id.clone();
        drop(held);
        newcomer.await.unwrap().unwrap();
        let new_id = again.await.unwrap().unwrap();

        assert_ne!(new_id, old_id);
        assert_eq!(
            provider.removed_names(),
            vec!["a-proof".to_string(), "b-proof".to_string()]
        );
        assert_eq!(pool.len(), 3);
        assert_eq!(provider.live_count(), 3);
    }

    #[tokio::test]
    async fn type_locks_are_released_after_use() {
        let provider = mock_provider();
        let pool = pool_with(test_config(2), provider.clone());

        drop(pool.get_or_create(&vt("doordash")).await.unwrap());
        provider.fail_create.store(true, Ordering::Relaxed);
        for i in 0..5 {
            assert!(pool.get_or_create(&vt(&format!("unknown{i}"))).await.is_err());
        }
        assert!(pool.evict(&vt("doordash")).await.unwrap());

        assert_eq!(pool.tracked_type_locks(), 0);
    }

    #[tokio::test]
    async fn lease_existing_never_creates() {
        let provider = mock_provider();
        let pool = pool_with(test_config(1), provider.clone());

        assert!(pool.lease_existing(&vt("a")).is_none());
        let id = pool.get_or_create(&vt("a")).await.unwrap().id.clone();
        assert_eq!(pool.lease_existing(&vt("a")).unwrap().id, id);
        assert!(pool.lease_existing(&vt("b")).is_none());
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn eviction_drain_is_bounded() {
        let provider = mock_provider();
        let config = PoolConfig {
            eviction_drain_timeout: Duration::from_millis(50),
            ..test_config(1)
        };
        let pool = pool_with(config, provider.clone());

        let _held = pool.get_or_create(&vt("a")).await.unwrap();
        let lease = pool.get_or_create(&vt("b")).await.unwrap();
        assert_eq!(lease.name, "b-proof");
        assert_eq!(provider.live_count(), 1);
    }

    #[tokio::test]
    async fn explicit_evict_removes_entry() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        drop(pool.get_or_create(&vt("doordash")).await.unwrap());
        assert!(pool.evict(&vt("doordash")).await.unwrap());
        assert!(!pool.evict(&vt("doordash")).await.unwrap());
        assert!(pool.is_empty());
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn reap_idle_skips_leased_entries() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        let _held = pool.get_or_create(&vt("busy")).await.unwrap();
        drop(pool.get_or_create(&vt("idle")).await.unwrap());

        let reaped = pool.reap_idle(Duration::ZERO).await;
        assert_eq!(reaped, 1);
        assert_eq!(provider.removed_names(), vec!["idle-proof".to_string()]);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn sweep_continues_past_failures() {
        let provider = mock_provider();
        let pool = pool_with(test_config(3), provider.clone());

        let a = pool.get_or_create(&vt("a")).await.unwrap();
        let handle_a = a.handle.clone();
        drop(a);
        drop(pool.get_or_create(&vt("b")).await.unwrap());
        drop(pool.get_or_create(&vt("c")).await.unwrap());
        provider.containers.lock().unwrap().remove(&handle_a);

        let report = pool.sweep().await;
        assert_eq!(report.removed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "a-proof");
        assert!(pool.is_empty());
        assert_eq!(provider.live_count(), 0);

        assert!(matches!(
            pool.get_or_create(&vt("a")).await,
            Err(SandboxError::Shutdown)
        ));
    }
}
