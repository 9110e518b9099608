use std::fmt;

/// Why a payload could not be delivered to (or a reply read from) a sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The per-call deadline elapsed.
    Timeout,
    /// The sandbox endpoint refused or dropped the connection.
    ConnectionRefused,
    /// No framed reply could be read (empty stream, bad endpoint, I/O error).
    Malformed(String),
}

/// The task handler answered, but not with an acceptable verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskHandlerErrorKind {
    /// Non-success HTTP status or non-zero exit status.
    BadStatus(i64),
    /// Reply was not JSON, or lacked a boolean `is_valid`.
    BadShape(String),
}

/// Gate at which attestation verification stopped.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttestationErrorKind {
    QuoteUnavailable { detail: String },
    ServiceUnreachable { detail: String },
    SignatureInvalid { detail: String },
    StatusNotOk { status: String },
    MeasurementMismatch { expected: String, actual: String },
}

impl fmt::Display for AttestationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuoteUnavailable { detail } => write!(f, "quote unavailable: {detail}"),
            Self::ServiceUnreachable { detail } => {
                write!(f, "attestation service unreachable: {detail}")
            }
            Self::SignatureInvalid { detail } => write!(f, "report signature invalid: {detail}"),
            Self::StatusNotOk { status } => write!(f, "quote status not OK: {status}"),
            Self::MeasurementMismatch { expected, actual } => {
                write!(f, "measurement mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

/// Errors returned by validator runtime operations.
#[derive(Debug)]
pub enum SandboxError {
    /// Sandbox provider (container runtime) failure.
    Provider(String),
    /// Sandbox never became reachable within the health-check budget.
    HealthCheckTimeout { validator_type: String, attempts: u32 },
    /// Payload delivery failed.
    Transport(TransportErrorKind),
    /// Task handler replied with an unusable verdict.
    TaskHandler(TaskHandlerErrorKind),
    /// Attestation gate failure. Only surfaced inside a `TrustDecision`.
    Attestation(AttestationErrorKind),
    /// The pool exceeded its capacity. Indicates a broken admission lock.
    CapacityInvariantViolation { live: usize, max: usize },
    /// Image metadata does not map to any supported build profile.
    UnsupportedProfile(String),
    /// External image build/sign tool failed.
    ImageBuild(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Sealed storage I/O failure.
    Storage(String),
    /// The pool is shutting down and admits no new sandboxes.
    Shutdown,
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Provider(msg) => write!(f, "provider error: {msg}"),
            SandboxError::HealthCheckTimeout {
                validator_type,
                attempts,
            } => write!(
                f,
                "health check timeout: validator {validator_type} not ready after {attempts} attempts"
            ),
            SandboxError::Transport(TransportErrorKind::Timeout) => {
                write!(f, "transport error: timed out")
            }
            SandboxError::Transport(TransportErrorKind::ConnectionRefused) => {
                write!(f, "transport error: connection refused")
            }
            SandboxError::Transport(TransportErrorKind::Malformed(msg)) => {
                write!(f, "transport error: malformed reply: {msg}")
            }
            SandboxError::TaskHandler(TaskHandlerErrorKind::BadStatus(code)) => {
                write!(f, "task handler error: bad status {code}")
            }
            SandboxError::TaskHandler(TaskHandlerErrorKind::BadShape(msg)) => {
                write!(f, "task handler error: bad response shape: {msg}")
            }
            SandboxError::Attestation(kind) => write!(f, "attestation error: {kind}"),
            SandboxError::CapacityInvariantViolation { live, max } => write!(
                f,
                "capacity invariant violated: {live} live sandboxes, maximum {max}"
            ),
            SandboxError::UnsupportedProfile(msg) => write!(f, "unsupported profile: {msg}"),
            SandboxError::ImageBuild(msg) => write!(f, "image build error: {msg}"),
            SandboxError::Validation(msg) => write!(f, "validation error: {msg}"),
            SandboxError::Storage(msg) => write!(f, "storage error: {msg}"),
            SandboxError::Shutdown => write!(f, "pool is shutting down"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<SandboxError> for String {
    fn from(err: SandboxError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
