//! Validator sandbox pool and attestation verification.
//!
//! This crate keeps a bounded pool of isolated task-handler sandboxes,
//! routes typed tasks to them over a fixed JSON protocol, and verifies
//! remote-attestation reports for hardware-isolated sandboxes.

pub mod api;
pub mod attestation;
pub mod config;
pub mod docker;
pub mod error;
pub mod image;
pub mod isolation;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod reaper;
pub mod router;
pub mod sandbox;
pub mod sealed;
pub mod transport;
pub mod util;

pub use attestation::{AttestationReport, AttestationVerifier, TrustDecision};
pub use config::{PoolConfig, SandboxSpec, TransportKind};
pub use error::{Result, SandboxError};
pub use pool::{PoolManager, SandboxLease};
pub use provider::SandboxProvider;
pub use router::TaskRouter;
pub use sandbox::{Endpoint, Sandbox, SandboxStatus, Task, ValidatorType};

pub const DEFAULT_MAX_VALIDATORS: usize = 3;
pub const DEFAULT_VALIDATOR_PORT: u16 = 8000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 35;
pub const DEFAULT_HEALTH_CHECK_RETRIES: u32 = 5;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_IAS_URL: &str = "https://api.trustedservices.intel.com/sgx/attestation/v4";
