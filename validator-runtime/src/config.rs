use once_cell::sync::OnceCell;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::isolation::IsolationConfig;
use crate::sandbox::ValidatorType;
use crate::{
    DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_HEALTH_CHECK_RETRIES, DEFAULT_IAS_URL,
    DEFAULT_MAX_VALIDATORS, DEFAULT_TIMEOUT_SECS, DEFAULT_VALIDATOR_PORT,
};

/// Which transport strategy reaches the task handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Http,
    Exec,
}

impl TransportKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Some(TransportKind::Http),
            "exec" => Some(TransportKind::Exec),
            _ => None,
        }
    }
}

/// Health-check polling budget applied after a sandbox is started.
#[derive(Clone, Debug)]
pub struct HealthCheckPolicy {
    pub retries: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_HEALTH_CHECK_RETRIES,
            interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Attestation service settings. Both the credential and the pinned root
/// must be configured for attestation to be available.
#[derive(Clone, Debug)]
pub struct AttestationConfig {
    pub service_url: String,
    pub api_key: String,
    pub root_ca_path: PathBuf,
}

/// Runtime configuration loaded once at startup from environment variables.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_validators: usize,
    pub hardware_isolation: bool,
    pub validator_port: u16,
    pub public_host: String,
    pub request_timeout: Duration,
    pub health: HealthCheckPolicy,
    pub transport: TransportKind,
    pub validator_command: Vec<String>,
    pub docker_host: Option<String>,
    pub sealed_root: PathBuf,
    pub idle_timeout: Option<Duration>,
    pub reaper_interval: Duration,
    pub eviction_drain_timeout: Duration,
    pub attestation: Option<AttestationConfig>,
    pub operator_api_port: u16,
    pub image_tool: String,
}

static POOL_CONFIG: OnceCell<PoolConfig> = OnceCell::new();

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
        .unwrap_or(false)
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_validators: DEFAULT_MAX_VALIDATORS,
            hardware_isolation: false,
            validator_port: DEFAULT_VALIDATOR_PORT,
            public_host: "127.0.0.1".to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            health: HealthCheckPolicy::default(),
            transport: TransportKind::Http,
            validator_command: vec!["python".into(), "/validate.py".into()],
            docker_host: None,
            sealed_root: PathBuf::from("/mnt/sealed"),
            idle_timeout: None,
            reaper_interval: Duration::from_secs(30),
            eviction_drain_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            attestation: None,
            operator_api_port: 9090,
            image_tool: "gsc".to_string(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables.
    /// Cached after the first call; subsequent calls return the same config.
    pub fn load() -> &'static PoolConfig {
        POOL_CONFIG.get_or_init(PoolConfig::from_env)
    }

    /// Read the environment without caching.
    pub fn from_env() -> PoolConfig {
        let defaults = PoolConfig::default();

        let max_validators = env_parse::<usize>("MAX_VALIDATORS")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_validators);
        let request_timeout = env_parse::<u64>("REQUEST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        let health = HealthCheckPolicy {
            retries: env_parse::<u32>("HEALTH_CHECK_RETRIES")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.health.retries),
            interval: env_parse::<u64>("HEALTH_CHECK_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.health.interval),
            probe_timeout: env_parse::<u64>("HEALTH_PROBE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.health.probe_timeout),
        };

        let transport = env::var("VALIDATOR_TRANSPORT")
            .ok()
            .and_then(|v| TransportKind::parse(&v))
            .unwrap_or_default();

        let validator_command = env_non_empty("VALIDATOR_COMMAND")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or(defaults.validator_command);

        let idle_timeout = env_parse::<u64>("POOL_IDLE_TIMEOUT_SECS")
            .filter(|v| *v > 0)
            .map(Duration::from_secs);

        let attestation = match (env_non_empty("IAS_API_KEY"), env_non_empty("IAS_ROOT_CA_PATH")) {
            (Some(api_key), Some(root)) => Some(AttestationConfig {
                service_url: env_non_empty("IAS_URL").unwrap_or_else(|| DEFAULT_IAS_URL.to_string()),
                api_key,
                root_ca_path: PathBuf::from(root),
            }),
            _ => None,
        };

        PoolConfig {
            max_validators,
            hardware_isolation: env_bool("SGX"),
            validator_port: env_parse::<u16>("VALIDATOR_PORT").unwrap_or(defaults.validator_port),
            public_host: env_non_empty("VALIDATOR_PUBLIC_HOST").unwrap_or(defaults.public_host),
            request_timeout,
            health,
            transport,
            validator_command,
            docker_host: env_non_empty("DOCKER_HOST"),
            sealed_root: env_non_empty("SEALED_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sealed_root),
            idle_timeout,
            reaper_interval: env_parse::<u64>("POOL_REAPER_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            eviction_drain_timeout: env_parse::<u64>("EVICTION_DRAIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(request_timeout),
            attestation,
            operator_api_port: env_parse::<u16>("OPERATOR_API_PORT")
                .unwrap_or(defaults.operator_api_port),
            image_tool: env_non_empty("GSC_TOOL").unwrap_or(defaults.image_tool),
        }
    }

    /// Build the creation request for one validator type.
    pub fn sandbox_spec(&self, validator_type: &ValidatorType) -> SandboxSpec {
        let name = validator_type.sandbox_name(self.hardware_isolation);
        let isolation = if self.hardware_isolation {
            IsolationConfig::sgx(&self.sealed_root, &name)
        } else {
            IsolationConfig::none()
        };
        SandboxSpec {
            image: name.clone(),
            name,
            container_port: self.validator_port,
            command: self.validator_command.clone(),
            isolation,
            transport: self.transport,
        }
    }
}

/// Everything the provider needs to create one sandbox.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub image: String,
    pub name: String,
    pub container_port: u16,
    pub command: Vec<String>,
    pub isolation: IsolationConfig,
    pub transport: TransportKind,
}
