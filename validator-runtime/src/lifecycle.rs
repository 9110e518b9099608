//! Sandbox lifecycle: create, health-check, restart, tear down.
//!
//! The controller constructs sandboxes on the pool's behalf and never
//! registers them anywhere itself. A sandbox returned from [`LifecycleController::create`]
//! is always `Running`; one that fails its health check is torn down before
//! the error is returned.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{HealthCheckPolicy, SandboxSpec};
use crate::error::{Result, SandboxError};
use crate::provider::SandboxProvider;
use crate::sandbox::{
    Endpoint, Sandbox, SandboxHandle, SandboxStatus, ValidatorType, next_sandbox_id,
};
use crate::util::http_client;

/// Path probed on HTTP handlers. Any HTTP response, whatever its status,
/// means the handler is serving.
pub const HEALTH_PATH: &str = "/health";

pub struct LifecycleController {
    provider: Arc<dyn SandboxProvider>,
    health: HealthCheckPolicy,
}

impl LifecycleController {
    pub fn new(provider: Arc<dyn SandboxProvider>, health: HealthCheckPolicy) -> Self {
        Self { provider, health }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Create, start and health-check a sandbox for `validator_type`.
    pub async fn create(&self, validator_type: &ValidatorType, spec: &SandboxSpec) -> Result<Sandbox> {
        info!(
            "lifecycle: creating sandbox {} ({} backend)",
            spec.name,
            self.provider.backend_name()
        );
        let handle = self.provider.create(spec).await?;

        if let Err(err) = self.provider.start(&handle).await {
            self.discard(&handle, &spec.name).await;
            return Err(err);
        }

        let endpoint = match self.provider.endpoint(&handle, spec).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.discard(&handle, &spec.name).await;
                return Err(err);
            }
        };

        let mut sandbox = Sandbox {
            id: next_sandbox_id(),
            validator_type: validator_type.clone(),
            name: spec.name.clone(),
            handle,
            status: SandboxStatus::Creating,
            created_at: Utc::now(),
            endpoint,
        };

        if let Err(err) = self.wait_healthy(&mut sandbox).await {
            self.discard(&sandbox.handle, &sandbox.name).await;
            return Err(err);
        }

        info!(
            "lifecycle: sandbox {} ready at {}",
            sandbox.name, sandbox.endpoint
        );
        Ok(sandbox)
    }

    /// Restart an existing sandbox in place. The endpoint is refreshed since
    /// published ports may change across restarts.
    pub async fn restart(&self, sandbox: &mut Sandbox, spec: &SandboxSpec) -> Result<()> {
        info!("lifecycle: restarting sandbox {}", sandbox.name);
        sandbox.status = SandboxStatus::Creating;

        if let Ok(true) = self.provider.is_running(&sandbox.handle).await {
            if let Err(err) = self.provider.stop(&sandbox.handle).await {
                warn!("lifecycle: stop before restart of {} failed: {err}", sandbox.name);
            }
        }

        if let Err(err) = self.provider.start(&sandbox.handle).await {
            sandbox.status = SandboxStatus::Unhealthy;
            return Err(err);
        }
        match self.provider.endpoint(&sandbox.handle, spec).await {
            Ok(endpoint) => sandbox.endpoint = endpoint,
            Err(err) => {
                sandbox.status = SandboxStatus::Unhealthy;
                return Err(err);
            }
        }
        self.wait_healthy(sandbox).await
    }

    /// Poll the sandbox until healthy or the retry budget is spent.
    async fn wait_healthy(&self, sandbox: &mut Sandbox) -> Result<()> {
        let retries = self.health.retries.max(1);
        for attempt in 1..=retries {
            if self.health_check(sandbox).await {
                sandbox.status = SandboxStatus::Running;
                return Ok(());
            }
            debug!(
                "lifecycle: health probe {attempt}/{retries} failed for {}",
                sandbox.name
            );
            if attempt < retries {
                tokio::time::sleep(self.health.interval).await;
            }
        }

        sandbox.status = SandboxStatus::Unhealthy;
        warn!(
            "lifecycle: sandbox {} unhealthy after {retries} attempts",
            sandbox.name
        );
        Err(SandboxError::HealthCheckTimeout {
            validator_type: sandbox.validator_type.to_string(),
            attempts: retries,
        })
    }

    /// Single health probe: the provider reports the sandbox running and, for
    /// HTTP endpoints, the handler answers an HTTP request. A bare TCP accept
    /// is not enough, since a port-publishing proxy accepts before the
    /// handler listens.
    pub async fn health_check(&self, sandbox: &Sandbox) -> bool {
        match self.provider.is_running(&sandbox.handle).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                debug!("lifecycle: is_running({}) failed: {err}", sandbox.name);
                return false;
            }
        }

        match &sandbox.endpoint {
            Endpoint::Http { host, port } => self.http_probe(host, *port).await,
            Endpoint::Exec { .. } => true,
        }
    }

    async fn http_probe(&self, host: &str, port: u16) -> bool {
        let client = match http_client() {
            Ok(client) => client,
            Err(err) => {
                warn!("lifecycle: {err}");
                return false;
            }
        };
        let url = format!("http://{host}:{port}{HEALTH_PATH}");
        match client
            .get(&url)
            .timeout(self.health.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                debug!("lifecycle: {url} answered {}", resp.status());
                true
            }
            Err(err) => {
                debug!("lifecycle: {url} not serving: {err}");
                false
            }
        }
    }

    /// Stop then remove. A stop failure is logged and removal still attempted.
    pub async fn teardown(&self, sandbox: &Sandbox) -> Result<()> {
        if let Err(err) = self.provider.stop(&sandbox.handle).await {
            warn!("lifecycle: failed to stop sandbox {}: {err}", sandbox.name);
        }
        self.provider.remove(&sandbox.handle).await?;
        info!("lifecycle: removed sandbox {}", sandbox.name);
        Ok(())
    }

    async fn discard(&self, handle: &SandboxHandle, name: &str) {
        if let Err(err) = self.provider.stop(handle).await {
            debug!("lifecycle: discard stop of {name} failed: {err}");
        }
        if let Err(err) = self.provider.remove(handle).await {
            warn!("lifecycle: failed to remove unusable sandbox {name}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::provider::mock::MockProvider;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> HealthCheckPolicy {
        HealthCheckPolicy {
            retries: 3,
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
        }
    }

    fn spec(name: &str) -> (ValidatorType, SandboxSpec) {
        let vt = ValidatorType::new(name).unwrap();
        let spec = PoolConfig::default().sandbox_spec(&vt);
        (vt, spec)
    }

    #[tokio::test]
    async fn create_marks_running_when_handler_answers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let provider = Arc::new(MockProvider::new(Endpoint::Http {
            host: "127.0.0.1".into(),
            port: server.address().port(),
        }));
        let lifecycle = LifecycleController::new(provider.clone(), fast_policy());

        let (vt, spec) = spec("doordash");
        let sandbox = lifecycle.create(&vt, &spec).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.name, "doordash-proof");
        assert!(sandbox.id.starts_with("sandbox-"));
        assert_eq!(provider.live_count(), 1);
    }

    #[tokio::test]
    async fn create_tears_down_when_never_healthy() {
        // Bind then drop to get a port that refuses connections.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let provider = Arc::new(MockProvider::new(Endpoint::Http {
            host: "127.0.0.1".into(),
            port,
        }));
        let lifecycle = LifecycleController::new(provider.clone(), fast_policy());

        let (vt, spec) = spec("analytics");
        let err = lifecycle.create(&vt, &spec).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::HealthCheckTimeout { attempts: 3, .. }
        ));
        assert_eq!(provider.live_count(), 0);
        assert_eq!(provider.removed_names(), vec!["analytics-proof".to_string()]);
    }

    #[tokio::test]
    async fn accepting_socket_without_http_answer_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::Relaxed);
                drop(stream);
            }
        });
        let provider = Arc::new(MockProvider::new(Endpoint::Http {
            host: "127.0.0.1".into(),
            port,
        }));
        let lifecycle = LifecycleController::new(provider.clone(), fast_policy());

        let (vt, spec) = spec("doordash");
        let err = lifecycle.create(&vt, &spec).await.unwrap_err();
        assert!(matches!(err, SandboxError::HealthCheckTimeout { .. }));
        assert!(accepted.load(Ordering::Relaxed) >= 1);
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn create_cleans_up_when_start_fails() {
        let provider = Arc::new(MockProvider::new(Endpoint::Exec {
            program: "true".into(),
            args: vec![],
        }));
        provider.fail_start.store(true, Ordering::Relaxed);
        let lifecycle = LifecycleController::new(provider.clone(), fast_policy());

        let (vt, spec) = spec("doordash");
        assert!(matches!(
            lifecycle.create(&vt, &spec).await,
            Err(SandboxError::Provider(_))
        ));
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn restart_revives_stopped_sandbox() {
        let provider = Arc::new(MockProvider::new(Endpoint::Exec {
            program: "true".into(),
            args: vec![],
        }));
        let lifecycle = LifecycleController::new(provider.clone(), fast_policy());
        let (vt, spec) = spec("doordash");
        let mut sandbox = lifecycle.create(&vt, &spec).await.unwrap();

        provider.kill(&sandbox.handle);
        assert!(!lifecycle.health_check(&sandbox).await);

        lifecycle.restart(&mut sandbox, &spec).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(lifecycle.health_check(&sandbox).await);
        assert_eq!(provider.start_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn teardown_removes_even_if_stop_fails() {
        let provider = Arc::new(MockProvider::new(Endpoint::Exec {
            program: "true".into(),
            args: vec![],
        }));
        let lifecycle = LifecycleController::new(provider.clone(), fast_policy());
        let (vt, spec) = spec("doordash");
        let sandbox = lifecycle.create(&vt, &spec).await.unwrap();

        provider.fail_stop.store(true, Ordering::Relaxed);
        lifecycle.teardown(&sandbox).await.unwrap();
        assert_eq!(provider.live_count(), 0);
    }
}
