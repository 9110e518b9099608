//! Core data model: validator types, sandboxes, endpoints and tasks.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SandboxError};

/// Opaque key identifying a class of task handler (e.g. `doordash`, `analytics`).
///
/// Restricted to ASCII alphanumerics, `-` and `_` because it is embedded in
/// sandbox and image names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidatorType(String);

impl ValidatorType {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SandboxError::Validation(
                "validator type must not be empty".into(),
            ));
        }
        if !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(SandboxError::Validation(format!(
                "invalid validator type '{trimmed}'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic sandbox (and image) name for this type.
    pub fn sandbox_name(&self, hardware_isolated: bool) -> String {
        if hardware_isolated {
            format!("gsc-{}-proof", self.0)
        } else {
            format!("{}-proof", self.0)
        }
    }
}

impl TryFrom<String> for ValidatorType {
    type Error = SandboxError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ValidatorType> for String {
    fn from(value: ValidatorType) -> Self {
        value.0
    }
}

impl fmt::Display for ValidatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Unhealthy,
    Stopped,
}

/// Provider-specific handle (container id for Docker).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle(pub String);

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a task handler inside a sandbox is reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// Task handler listens for `POST /` on a published TCP port.
    Http { host: String, port: u16 },
    /// Task handler is invoked per call; one JSON line in, one JSON line out.
    Exec { program: String, args: Vec<String> },
}

impl Endpoint {
    pub fn base_url(&self) -> Option<String> {
        match self {
            Endpoint::Http { host, port } => Some(format!("http://{host}:{port}")),
            Endpoint::Exec { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http { host, port } => write!(f, "http://{host}:{port}"),
            Endpoint::Exec { program, args } => write!(f, "exec:{program} {}", args.join(" ")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub validator_type: ValidatorType,
    pub name: String,
    pub handle: SandboxHandle,
    pub status: SandboxStatus,
    /// Set once when the sandbox is constructed; sole eviction ordering key.
    pub created_at: DateTime<Utc>,
    pub endpoint: Endpoint,
}

impl Sandbox {
    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

pub(crate) fn next_sandbox_id() -> String {
    format!("sandbox-{}", uuid::Uuid::new_v4())
}

/// A typed unit of work for one task handler. Immutable once built.
#[derive(Clone, Debug)]
pub struct Task {
    validator_type: ValidatorType,
    payload: Value,
    timeout: Duration,
}

impl Task {
    pub fn new(validator_type: ValidatorType, payload: Value, timeout: Duration) -> Self {
        Self {
            validator_type,
            payload,
            timeout,
        }
    }

    pub fn validator_type(&self) -> &ValidatorType {
        &self.validator_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
