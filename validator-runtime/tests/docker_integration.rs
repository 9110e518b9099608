//! Docker provider integration tests.
//!
//! These create real containers and talk to them over the exec transport.
//!
//! Run:
//!   REAL_DOCKER=1 cargo test --test docker_integration -- --test-threads=1
//!
//! Requires a reachable Docker daemon and a local image (default:
//! `alpine:3`). Override with TEST_IMAGE.

use std::time::Duration;

use serde_json::json;

use validator_runtime::config::{PoolConfig, SandboxSpec, TransportKind};
use validator_runtime::docker::DockerProvider;
use validator_runtime::isolation::IsolationConfig;
use validator_runtime::provider::SandboxProvider;
use validator_runtime::router::parse_verdict;
use validator_runtime::transport::{Transport, transport_for};

fn real_docker() -> bool {
    std::env::var("REAL_DOCKER")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

macro_rules! skip_unless_real {
    () => {
        if !real_docker() {
            eprintln!("Skipped (set REAL_DOCKER=1 to enable)");
            return;
        }
    };
}

fn spec(name: &str) -> SandboxSpec {
    SandboxSpec {
        image: std::env::var("TEST_IMAGE").unwrap_or_else(|_| "alpine:3".into()),
        name: name.into(),
        container_port: 8000,
        command: vec![
            "sh".into(),
            "-c".into(),
            r#"read line; echo '{"is_valid": true}'"#.into(),
        ],
        isolation: IsolationConfig::none(),
        transport: TransportKind::Exec,
    }
}

#[tokio::test]
async fn exec_sandbox_lifecycle() {
    skip_unless_real!();

    let provider = DockerProvider::new(&PoolConfig::default());
    let spec = spec("validator-runtime-it-exec");

    let handle = provider.create(&spec).await.unwrap();
    provider.start(&handle).await.unwrap();
    assert!(provider.is_running(&handle).await.unwrap());
    assert!(provider.list_managed().await.unwrap().contains(&handle));

    let endpoint = provider.endpoint(&handle, &spec).await.unwrap();
    let reply = tokio::time::timeout(
        Duration::from_secs(20),
        transport_for(TransportKind::Exec).send(&endpoint, &json!({"id": 1})),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(parse_verdict(&reply).unwrap());

    provider.stop(&handle).await.unwrap();
    assert!(!provider.is_running(&handle).await.unwrap());
    provider.remove(&handle).await.unwrap();
    assert!(!provider.list_managed().await.unwrap().contains(&handle));
}

#[tokio::test]
async fn create_replaces_stale_container_with_same_name() {
    skip_unless_real!();

    let provider = DockerProvider::new(&PoolConfig::default());
    let spec = spec("validator-runtime-it-stale");

    let first = provider.create(&spec).await.unwrap();
    let second = provider.create(&spec).await.unwrap();
    assert_ne!(first, second);

    let managed = provider.list_managed().await.unwrap();
    assert!(!managed.contains(&first));
    assert!(managed.contains(&second));
    provider.remove(&second).await.unwrap();
}
