//! Docker-backed [`SandboxProvider`].

use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions,
};
use docktopus::bollard::models::{DeviceMapping, HostConfig, PortBinding, PortMap};
use docktopus::container::Container;
use std::collections::HashMap;
use tokio::sync::OnceCell as AsyncOnceCell;
use tracing::{info, warn};

use crate::config::{PoolConfig, SandboxSpec, TransportKind};
use crate::error::{Result, SandboxError};
use crate::provider::{MANAGED_LABEL, SandboxProvider};
use crate::sandbox::{Endpoint, SandboxHandle};

/// Keeps an exec-mode container alive between per-call invocations.
const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

pub struct DockerProvider {
    docker_host: Option<String>,
    public_host: String,
    builder: AsyncOnceCell<DockerBuilder>,
}

impl DockerProvider {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            docker_host: config.docker_host.clone(),
            public_host: config.public_host.clone(),
            builder: AsyncOnceCell::const_new(),
        }
    }

    async fn builder(&self) -> Result<&DockerBuilder> {
        self.builder
            .get_or_try_init(|| async {
                let builder = match self.docker_host.as_deref() {
                    Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                        SandboxError::Provider(format!(
                            "Failed to connect to docker at {host}: {err}"
                        ))
                    })?,
                    None => DockerBuilder::new().await.map_err(|err| {
                        SandboxError::Provider(format!("Failed to connect to docker: {err}"))
                    })?,
                };
                Ok(builder)
            })
            .await
    }

    async fn load(&self, handle: &SandboxHandle) -> Result<Container> {
        let builder = self.builder().await?;
        Container::from_id(builder.client(), &handle.0)
            .await
            .map_err(|err| SandboxError::Provider(format!("Failed to load container: {err}")))
    }
}

/// Build the container config: published handler port, devices, binds,
/// environment and the managed label.
fn build_docker_config(spec: &SandboxSpec) -> BollardConfig<String> {
    let port_key = format!("{}/tcp", spec.container_port);

    let mut port_bindings = PortMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: None,
        }]),
    );

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let devices = spec.isolation.devices.as_ref().map(|devices| {
        devices
            .iter()
            .map(|d| DeviceMapping {
                path_on_host: Some(d.host_path.clone()),
                path_in_container: Some(d.container_path.clone()),
                cgroup_permissions: Some("rwm".to_string()),
            })
            .collect()
    });
    let binds = spec.isolation.mounts.as_ref().map(|_| spec.isolation.bindings());

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        devices,
        binds,
        ..Default::default()
    };

    let env = spec.isolation.extra_env.as_ref().map(|_| spec.isolation.env_vars());

    let cmd = match spec.transport {
        TransportKind::Http => spec.command.clone(),
        TransportKind::Exec => IDLE_COMMAND.iter().map(|s| s.to_string()).collect(),
    };

    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    BollardConfig {
        image: Some(spec.image.clone()),
        cmd: Some(cmd),
        env,
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        labels: Some(labels),
        ..Default::default()
    }
}

fn extract_host_port(
    inspect: &docktopus::bollard::models::ContainerInspectResponse,
    container_port: u16,
) -> Result<u16> {
    let key = format!("{container_port}/tcp");
    let bindings = inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.ports.as_ref())
        .and_then(|ports| ports.get(&key))
        .and_then(|v| v.as_ref())
        .ok_or_else(|| SandboxError::Provider(format!("Missing port bindings for {key}")))?;
    let host_port = bindings
        .first()
        .and_then(|binding| binding.host_port.as_ref())
        .ok_or_else(|| SandboxError::Provider(format!("Missing host port for {key}")))?;
    host_port
        .parse::<u16>()
        .map_err(|_| SandboxError::Provider(format!("Invalid host port for {key}")))
}

#[async_trait::async_trait]
impl SandboxProvider for DockerProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let builder = self.builder().await?;
        let client = builder.client();

        // A container with the same deterministic name would make create fail.
        if client
            .remove_container(
                &spec.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .is_ok()
        {
            info!("docker: removed stale container {}", spec.name);
        }

        let response = client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                build_docker_config(spec),
            )
            .await
            .map_err(|err| {
                SandboxError::Provider(format!("Failed to create container {}: {err}", spec.name))
            })?;

        for warning in &response.warnings {
            warn!("docker: create {}: {warning}", spec.name);
        }
        Ok(SandboxHandle(response.id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<()> {
        let mut container = self.load(handle).await?;
        container
            .start(false)
            .await
            .map_err(|err| SandboxError::Provider(format!("Failed to start container: {err}")))
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
        let mut container = self.load(handle).await?;
        container
            .stop()
            .await
            .map_err(|err| SandboxError::Provider(format!("Failed to stop container: {err}")))
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<()> {
        let container = self.load(handle).await?;
        container
            .remove(Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }))
            .await
            .map_err(|err| SandboxError::Provider(format!("Failed to remove container: {err}")))
    }

    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool> {
        let builder = self.builder().await?;
        let inspect = builder
            .client()
            .inspect_container(&handle.0, None::<InspectContainerOptions>)
            .await
            .map_err(|err| SandboxError::Provider(format!("Failed to inspect container: {err}")))?;
        Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn endpoint(&self, handle: &SandboxHandle, spec: &SandboxSpec) -> Result<Endpoint> {
        match spec.transport {
            TransportKind::Exec => {
                let mut args = vec!["exec".to_string(), "-i".to_string(), handle.0.clone()];
                args.extend(spec.command.iter().cloned());
                Ok(Endpoint::Exec {
                    program: "docker".to_string(),
                    args,
                })
            }
            TransportKind::Http => {
                let builder = self.builder().await?;
                let inspect = builder
                    .client()
                    .inspect_container(&handle.0, None::<InspectContainerOptions>)
                    .await
                    .map_err(|err| {
                        SandboxError::Provider(format!("Failed to inspect container: {err}"))
                    })?;
                let port = extract_host_port(&inspect, spec.container_port)?;
                Ok(Endpoint::Http {
                    host: self.public_host.clone(),
                    port,
                })
            }
        }
    }

    async fn list_managed(&self) -> Result<Vec<SandboxHandle>> {
        let builder = self.builder().await?;
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        let containers = builder
            .client()
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|err| SandboxError::Provider(format!("Failed to list containers: {err}")))?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.id.map(SandboxHandle))
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "docker"
    }
}
