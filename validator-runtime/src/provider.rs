//! Sandbox provider trait: the narrow interface to a container runtime.
//!
//! The pool never talks to Docker directly; it goes through this trait so the
//! admission logic can be exercised against [`mock::MockProvider`].

use crate::config::SandboxSpec;
use crate::error::Result;
use crate::sandbox::{Endpoint, SandboxHandle};

/// Label attached to every sandbox this process creates.
pub const MANAGED_LABEL: &str = "proof-node.managed";

#[async_trait::async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create (but do not start) a sandbox from `spec`.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    async fn start(&self, handle: &SandboxHandle) -> Result<()>;

    async fn stop(&self, handle: &SandboxHandle) -> Result<()>;

    /// Remove the sandbox and release all its resources.
    async fn remove(&self, handle: &SandboxHandle) -> Result<()>;

    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool>;

    /// Address (or exec invocation) through which the task handler is reached.
    async fn endpoint(&self, handle: &SandboxHandle, spec: &SandboxSpec) -> Result<Endpoint>;

    /// Sandboxes carrying [`MANAGED_LABEL`], including ones left by a previous run.
    async fn list_managed(&self) -> Result<Vec<SandboxHandle>>;

    fn backend_name(&self) -> &'static str;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::error::SandboxError;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug)]
    pub struct MockContainer {
        pub name: String,
        pub running: bool,
    }

    /// In-memory provider for tests.
    ///
    /// Tracks call counts via atomics. Every sandbox gets the same endpoint,
    /// which tests point at a local listener or a wiremock server.
    pub struct MockProvider {
        pub endpoint: Mutex<Endpoint>,
        pub create_count: AtomicUsize,
        pub start_count: AtomicUsize,
        pub stop_count: AtomicUsize,
        pub remove_count: AtomicUsize,
        pub fail_create: AtomicBool,
        pub fail_start: AtomicBool,
        pub fail_stop: AtomicBool,
        /// Artificial latency added to `create`, in milliseconds.
        pub create_delay_ms: AtomicU64,
        /// When set, `create` force-removes any container with the same name,
        /// the way the Docker provider clears stale names.
        pub replace_same_name: AtomicBool,
        pub containers: Mutex<HashMap<SandboxHandle, MockContainer>>,
        pub removed: Mutex<Vec<String>>,
        next_id: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(endpoint: Endpoint) -> Self {
            Self {
                endpoint: Mutex::new(endpoint),
                create_count: AtomicUsize::new(0),
                start_count: AtomicUsize::new(0),
                stop_count: AtomicUsize::new(0),
                remove_count: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                fail_stop: AtomicBool::new(false),
                create_delay_ms: AtomicU64::new(0),
                replace_same_name: AtomicBool::new(false),
                containers: Mutex::new(HashMap::new()),
                removed: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(0),
            }
        }

        pub fn with_create_delay(self, delay: Duration) -> Self {
            self.create_delay_ms
                .store(delay.as_millis() as u64, Ordering::Relaxed);
            self
        }

        pub fn with_name_replacement(self) -> Self {
            self.replace_same_name.store(true, Ordering::Relaxed);
            self
        }

        /// Simulate the container dying behind the pool's back.
        pub fn kill(&self, handle: &SandboxHandle) {
            let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = containers.get_mut(handle) {
                c.running = false;
            }
        }

        /// Seed a container as if left over from a previous run.
        pub fn seed(&self, name: &str, running: bool) -> SandboxHandle {
            let handle = SandboxHandle(format!(
                "mock-{}",
                self.next_id.fetch_add(1, Ordering::Relaxed)
            ));
            self.containers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    handle.clone(),
                    MockContainer {
                        name: name.to_string(),
                        running,
                    },
                );
            handle
        }

        pub fn live_count(&self) -> usize {
            self.containers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len()
        }

        pub fn removed_names(&self) -> Vec<String> {
            self.removed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    #[async_trait::async_trait]
    impl SandboxProvider for MockProvider {
        async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
            self.create_count.fetch_add(1, Ordering::Relaxed);
            let delay = self.create_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_create.load(Ordering::Relaxed) {
                return Err(SandboxError::Provider("Mock create failure".into()));
            }
            if self.replace_same_name.load(Ordering::Relaxed) {
                let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
                let mut removed = self.removed.lock().unwrap_or_else(|e| e.into_inner());
                containers.retain(|_, c| {
                    let stale = c.name == spec.name;
                    if stale {
                        removed.push(format!("force:{}", c.name));
                    }
                    !stale
                });
            }
            Ok(self.seed(&spec.name, false))
        }

        async fn start(&self, handle: &SandboxHandle) -> Result<()> {
            self.start_count.fetch_add(1, Ordering::Relaxed);
            if self.fail_start.load(Ordering::Relaxed) {
                return Err(SandboxError::Provider("Mock start failure".into()));
            }
            let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            let container = containers
                .get_mut(handle)
                .ok_or_else(|| SandboxError::Provider(format!("No such container {handle}")))?;
            container.running = true;
            Ok(())
        }

        async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
            self.stop_count.fetch_add(1, Ordering::Relaxed);
            if self.fail_stop.load(Ordering::Relaxed) {
                return Err(SandboxError::Provider("Mock stop failure".into()));
            }
            self.kill(handle);
            Ok(())
        }

        async fn remove(&self, handle: &SandboxHandle) -> Result<()> {
            self.remove_count.fetch_add(1, Ordering::Relaxed);
            let removed = self
                .containers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(handle);
            match removed {
                Some(c) => {
                    self.removed
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(c.name);
                    Ok(())
                }
                None => Err(SandboxError::Provider(format!("No such container {handle}"))),
            }
        }

        async fn is_running(&self, handle: &SandboxHandle) -> Result<bool> {
            Ok(self
                .containers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(handle)
                .is_some_and(|c| c.running))
        }

        async fn endpoint(&self, _handle: &SandboxHandle, _spec: &SandboxSpec) -> Result<Endpoint> {
            Ok(self
                .endpoint
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone())
        }

        async fn list_managed(&self) -> Result<Vec<SandboxHandle>> {
            Ok(self
                .containers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .cloned()
                .collect())
        }

        fn backend_name(&self) -> &'static str {
            "mock"
        }
    }
}
