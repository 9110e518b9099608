//! Task router: resolves a task's sandbox through the pool, sends the
//! payload over the configured transport, and decodes the verdict.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError, TaskHandlerErrorKind, TransportErrorKind};
use crate::pool::PoolManager;
use crate::sandbox::{Task, ValidatorType};
use crate::transport::Transport;
use crate::util::elapsed_ms;

/// Upper bound on concurrent flows in [`TaskRouter::dispatch_all`].
pub const MAX_DISPATCH_CONCURRENCY: usize = 10;

pub struct TaskRouter {
    pool: Arc<PoolManager>,
    transport: Arc<dyn Transport>,
}

/// Decode `{"is_valid": bool}`. Any other shape is a handler error.
pub fn parse_verdict(reply: &Value) -> Result<bool> {
    reply
        .get("is_valid")
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            SandboxError::TaskHandler(TaskHandlerErrorKind::BadShape(format!(
                "expected {{\"is_valid\": bool}}, got {reply}"
            )))
        })
}

impl TaskRouter {
    pub fn new(pool: Arc<PoolManager>, transport: Arc<dyn Transport>) -> Self {
        Self { pool, transport }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Build a task with the configured default deadline.
    pub fn task(&self, validator_type: ValidatorType, payload: Value) -> Task {
        Task::new(validator_type, payload, self.pool.config().request_timeout)
    }

    /// Run one task end to end and return the handler's verdict.
    ///
    /// The deadline covers the transport call only, not sandbox creation.
    /// A timeout leaves the sandbox pooled; a refused connection marks it
    /// unhealthy so the next request restarts it.
    pub async fn dispatch(&self, task: &Task) -> Result<bool> {
        let started = Instant::now();
        let validator_type = task.validator_type();

        let lease = match self.pool.get_or_create(validator_type).await {
            Ok(lease) => lease,
            Err(err) => {
                self.pool.metrics().record_failure(elapsed_ms(started), false);
                warn!("router: no sandbox for {validator_type}: {err}");
                return Err(err);
            }
        };

        debug!(
            "router: sending {validator_type} task to {} via {}",
            lease.endpoint,
            self.transport.name()
        );
        let outcome = match tokio::time::timeout(
            task.timeout(),
            self.transport.send(&lease.endpoint, task.payload()),
        )
        .await
        {
            Ok(reply) => reply.and_then(|reply| parse_verdict(&reply)),
            Err(_) => Err(SandboxError::Transport(TransportErrorKind::Timeout)),
        };

        let duration_ms = elapsed_ms(started);
        match &outcome {
            Ok(valid) => {
                self.pool.metrics().record_task(duration_ms, *valid);
                info!("router: {validator_type} verdict is_valid={valid} ({duration_ms}ms)");
            }
            Err(err) => {
                if matches!(
                    err,
                    SandboxError::Transport(TransportErrorKind::ConnectionRefused)
                ) {
                    self.pool.mark_unhealthy(validator_type, &lease.id);
                }
                let timed_out = matches!(err, SandboxError::Transport(TransportErrorKind::Timeout));
                self.pool.metrics().record_failure(duration_ms, timed_out);
                warn!("router: {validator_type} task failed after {duration_ms}ms: {err}");
            }
        }
        outcome
    }

    /// Dispatch a batch with at most `concurrency` flows in flight. Results
    /// are returned in input order.
    pub async fn dispatch_all(
        self: &Arc<Self>,
        tasks: Vec<Task>,
        concurrency: usize,
    ) -> Vec<Result<bool>> {
        let concurrency = concurrency.clamp(1, MAX_DISPATCH_CONCURRENCY);
        let sem = Arc::new(Semaphore::new(concurrency));
        let mut set = JoinSet::new();
        let total = tasks.len();

        for (idx, task) in tasks.into_iter().enumerate() {
            let sem = sem.clone();
            let router = self.clone();
            set.spawn(async move {
                let _permit = sem.acquire().await;
                (idx, router.dispatch(&task).await)
            });
        }

        let mut results: Vec<Option<Result<bool>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(err) => warn!("router: dispatch flow aborted: {err}"),
            }
        }
        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(SandboxError::Provider("dispatch flow aborted".into()))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckPolicy, PoolConfig};
    use crate::metrics::PoolMetrics;
    use crate::provider::mock::MockProvider;
    use crate::sandbox::{Endpoint, SandboxStatus};
    use crate::transport::HttpTransport;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Arc<TaskRouter>, Arc<MockProvider>) {
        let addr = server.address();
        let provider = Arc::new(MockProvider::new(Endpoint::Http {
            host: addr.ip().to_string(),
            port: addr.port(),
        }));
        let config = PoolConfig {
            max_validators: 2,
            health: HealthCheckPolicy {
                retries: 2,
                interval: Duration::from_millis(5),
                probe_timeout: Duration::from_millis(200),
            },
            ..PoolConfig::default()
        };
        let pool = Arc::new(PoolManager::new(
            config,
            provider.clone(),
            Arc::new(PoolMetrics::new()),
        ));
        (
            Arc::new(TaskRouter::new(pool, Arc::new(HttpTransport))),
            provider,
        )
    }

    fn task(name: &str, timeout: Duration) -> Task {
        Task::new(
            ValidatorType::new(name).unwrap(),
            json!({"proof": "abc"}),
            timeout,
        )
    }

    #[test]
    fn verdict_requires_boolean_is_valid() {
        assert!(parse_verdict(&json!({"is_valid": true})).unwrap());
        assert!(!parse_verdict(&json!({"is_valid": false, "extra": 1})).unwrap());
        assert!(parse_verdict(&json!({"is_valid": "true"})).is_err());
        assert!(parse_verdict(&json!({"valid": true})).is_err());
        assert!(parse_verdict(&json!([true])).is_err());
    }

    #[tokio::test]
    async fn dispatch_returns_handler_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(json!({"proof": "abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_valid": true})))
            .expect(2)
            .mount(&server)
            .await;

        let (router, provider) = setup(&server).await;
        assert!(router.dispatch(&task("doordash", Duration::from_secs(5))).await.unwrap());
        assert!(router.dispatch(&task("doordash", Duration::from_secs(5))).await.unwrap());
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 1);
        assert_eq!(router.pool().metrics().valid_verdicts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn dispatch_false_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_valid": false})))
            .mount(&server)
            .await;

        let (router, _) = setup(&server).await;
        assert!(!router.dispatch(&task("analytics", Duration::from_secs(5))).await.unwrap());
    }

    #[tokio::test]
    async fn server_error_is_bad_status_and_keeps_sandbox() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (router, _) = setup(&server).await;
        let err = router
            .dispatch(&task("doordash", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::TaskHandler(TaskHandlerErrorKind::BadStatus(500))
        ));
        let pooled = router.pool().snapshot();
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].sandbox.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn non_json_reply_is_bad_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("definitely not json"))
            .mount(&server)
            .await;

        let (router, _) = setup(&server).await;
        let err = router
            .dispatch(&task("doordash", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::TaskHandler(TaskHandlerErrorKind::BadShape(_))
        ));
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_sandbox_stays_pooled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"is_valid": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let (router, provider) = setup(&server).await;
        let err = router
            .dispatch(&task("doordash", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Transport(TransportErrorKind::Timeout)
        ));
        assert_eq!(router.pool().len(), 1);
        assert_eq!(provider.remove_count.load(Ordering::Relaxed), 0);
        assert_eq!(router.pool().metrics().timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn dispatch_all_preserves_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"n": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_valid": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!({"n": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_valid": false})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!({"n": 3})))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (router, provider) = setup(&server).await;
        let tasks = (1..=3)
            .map(|n| {
                Task::new(
                    ValidatorType::new("doordash").unwrap(),
                    json!({"n": n}),
                    Duration::from_secs(5),
                )
            })
            .collect();

        let results = router.dispatch_all(tasks, 3).await;
        assert_eq!(results.len(), 3);
        assert!(*results[0].as_ref().unwrap());
        assert!(!*results[1].as_ref().unwrap());
        assert!(matches!(
            results[2],
            Err(SandboxError::TaskHandler(TaskHandlerErrorKind::BadStatus(503)))
        ));
        assert_eq!(provider.create_count.load(Ordering::Relaxed), 1);
    }
}
