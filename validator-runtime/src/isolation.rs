//! Isolation capabilities requested for a sandbox.
//!
//! Every capability is an explicit optional field: `None` means "not
//! requested", never "use some default". Providers translate the fields
//! one-to-one into their own configuration.

use std::path::{Path, PathBuf};

/// Host device passed through into the sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMapping {
    pub host_path: String,
    pub container_path: String,
}

impl DeviceMapping {
    pub fn same_path(path: &str) -> Self {
        Self {
            host_path: path.to_string(),
            container_path: path.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub mode: MountMode,
}

impl BindMount {
    /// Docker `-v` style binding string.
    pub fn to_binding(&self) -> String {
        let mode = match self.mode {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        };
        format!("{}:{}:{mode}", self.source.display(), self.target)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsolationConfig {
    pub devices: Option<Vec<DeviceMapping>>,
    pub mounts: Option<Vec<BindMount>>,
    pub extra_env: Option<Vec<(String, String)>>,
}

pub const SGX_ENCLAVE_DEVICE: &str = "/dev/sgx_enclave";
pub const SGX_PROVISION_DEVICE: &str = "/dev/sgx_provision";
pub const AESMD_SOCKET_DIR: &str = "/var/run/aesmd";
pub const SEALED_MOUNT_TARGET: &str = "/sealed";

impl IsolationConfig {
    /// Plain container: nothing requested.
    pub fn none() -> Self {
        Self::default()
    }

    /// Gramine/SGX enclave: enclave devices, the AESM socket, and a
    /// per-sandbox sealed-storage directory.
    pub fn sgx(sealed_root: &Path, sandbox_name: &str) -> Self {
        Self {
            devices: Some(vec![
                DeviceMapping::same_path(SGX_ENCLAVE_DEVICE),
                DeviceMapping::same_path(SGX_PROVISION_DEVICE),
            ]),
            mounts: Some(vec![
                BindMount {
                    source: PathBuf::from(AESMD_SOCKET_DIR),
                    target: AESMD_SOCKET_DIR.to_string(),
                    mode: MountMode::ReadWrite,
                },
                BindMount {
                    source: sealed_root.join(sandbox_name),
                    target: SEALED_MOUNT_TARGET.to_string(),
                    mode: MountMode::ReadWrite,
                },
            ]),
            extra_env: Some(vec![("SGX_AESM_ADDR".to_string(), "1".to_string())]),
        }
    }

    pub fn env_vars(&self) -> Vec<String> {
        self.extra_env
            .iter()
            .flatten()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    pub fn bindings(&self) -> Vec<String> {
        self.mounts.iter().flatten().map(BindMount::to_binding).collect()
    }
}
