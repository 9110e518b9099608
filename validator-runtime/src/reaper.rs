//! Background pool maintenance.
//!
//! - `reaper_tick()`: evicts sandboxes idle longer than the configured timeout
//! - `reconcile_on_startup()`: removes managed sandboxes left by a previous run
//! - `run_reaper()`: ticks until cancelled

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pool::PoolManager;
use crate::sandbox::SandboxHandle;

/// Evict idle sandboxes. A no-op when no idle timeout is configured.
pub async fn reaper_tick(pool: &PoolManager) -> usize {
    let Some(idle) = pool.config().idle_timeout else {
        return 0;
    };
    let reaped = pool.reap_idle(idle).await;
    if reaped > 0 {
        info!("reaper: evicted {reaped} idle sandboxes");
    }
    reaped
}

/// Remove every provider-listed managed sandbox the pool does not own.
///
/// Called once before serving, so that sandboxes orphaned by a crash do not
/// count against host resources or collide with deterministic names.
pub async fn reconcile_on_startup(pool: &PoolManager) -> usize {
    let provider = pool.lifecycle().provider();
    let listed = match provider.list_managed().await {
        Ok(handles) => handles,
        Err(err) => {
            error!("reconcile: failed to list managed sandboxes: {err}");
            return 0;
        }
    };

    let owned: HashSet<SandboxHandle> = pool
        .snapshot()
        .into_iter()
        .map(|view| view.sandbox.handle)
        .collect();

    let mut removed = 0;
    for handle in listed.into_iter().filter(|h| !owned.contains(h)) {
        if matches!(provider.is_running(&handle).await, Ok(true)) {
            if let Err(err) = provider.stop(&handle).await {
                error!("reconcile: failed to stop stale sandbox {handle}: {err}");
            }
        }
        match provider.remove(&handle).await {
            Ok(()) => {
                info!("reconcile: removed stale sandbox {handle}");
                removed += 1;
            }
            Err(err) => error!("reconcile: failed to remove stale sandbox {handle}: {err}"),
        }
    }
    pool.metrics().record_reconciled(removed as u64);
    removed
}

pub async fn run_reaper(pool: Arc<PoolManager>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(pool.config().reaper_interval);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("reaper: shutting down");
                return;
            }
            _ = interval.tick() => {
                reaper_tick(&pool).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckPolicy, PoolConfig};
    use crate::metrics::PoolMetrics;
    use crate::provider::mock::MockProvider;
    use crate::sandbox::{Endpoint, ValidatorType};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn pool(provider: Arc<MockProvider>, idle_timeout: Option<Duration>) -> Arc<PoolManager> {
        let config = PoolConfig {
            max_validators: 3,
            idle_timeout,
            reaper_interval: Duration::from_millis(20),
            health: HealthCheckPolicy {
                retries: 1,
                interval: Duration::from_millis(1),
                probe_timeout: Duration::from_millis(50),
            },
            ..PoolConfig::default()
        };
        Arc::new(PoolManager::new(config, provider, Arc::new(PoolMetrics::new())))
    }

    fn exec_provider() -> Arc<MockProvider> {
        Arc::new(MockProvider::new(Endpoint::Exec {
            program: "cat".into(),
            args: vec![],
        }))
    }

    #[tokio::test]
    async fn reconcile_removes_only_unowned_sandboxes() {
        let provider = exec_provider();
        let pool = pool(provider.clone(), None);

        let owned = pool
            .get_or_create(&ValidatorType::new("doordash").unwrap())
            .await
            .unwrap();
        provider.seed("analytics-proof", true);
        provider.seed("old-proof", false);

        assert_eq!(reconcile_on_startup(&pool).await, 2);
        assert_eq!(provider.live_count(), 1);
        let mut removed = provider.removed_names();
        removed.sort();
        assert_eq!(removed, vec!["analytics-proof", "old-proof"]);
        assert_eq!(pool.metrics().reconciled.load(Ordering::Relaxed), 2);
        drop(owned);
    }

    #[tokio::test]
    async fn tick_without_idle_timeout_is_noop() {
        let provider = exec_provider();
        let pool = pool(provider.clone(), None);
        drop(
            pool.get_or_create(&ValidatorType::new("doordash").unwrap())
                .await
                .unwrap(),
        );
        assert_eq!(reaper_tick(&pool).await, 0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn reaper_loop_evicts_idle_until_cancelled() {
        let provider = exec_provider();
        let pool = pool(provider.clone(), Some(Duration::from_millis(10)));
        drop(
            pool.get_or_create(&ValidatorType::new("doordash").unwrap())
                .await
                .unwrap(),
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_reaper(pool.clone(), token.clone()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !pool.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(provider.live_count(), 0);
        assert_eq!(pool.metrics().reaped_idle.load(Ordering::Relaxed), 1);
    }
}
