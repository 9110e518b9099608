//! Per-sandbox sealed storage: one JSON document per sandbox at
//! `<root>/<name>/sealed_data.txt`, the host side of the `/sealed` mount.
//!
//! Every seal replaces the previous content entirely. Reading a sandbox
//! that was never sealed yields `None`.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SandboxError};

pub const SEALED_FILE_NAME: &str = "sealed_data.txt";

fn storage_err(path: &Path, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Storage(format!("{}: {err}", path.display()))
}

#[derive(Clone, Debug)]
pub struct SealedStore {
    root: PathBuf,
}

impl SealedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, sandbox_name: &str) -> Result<PathBuf> {
        if sandbox_name.is_empty()
            || sandbox_name.contains(['/', '\\'])
            || sandbox_name.starts_with('.')
        {
            return Err(SandboxError::Validation(format!(
                "invalid sandbox name for sealed storage: {sandbox_name:?}"
            )));
        }
        Ok(self.root.join(sandbox_name).join(SEALED_FILE_NAME))
    }

    /// Overwrite the sealed document. Written to a temporary file and renamed
    /// into place, so readers never observe a partial write.
    pub async fn seal(&self, sandbox_name: &str, payload: &Value) -> Result<()> {
        let path = self.path_for(sandbox_name)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        create_private_dir(&dir).await?;

        let bytes = serde_json::to_vec(payload).map_err(|err| storage_err(&path, err))?;
        let tmp = dir.join(format!(".{SEALED_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|err| storage_err(&tmp, err))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| storage_err(&path, err))?;
        debug!("sealed: wrote {} bytes for {sandbox_name}", bytes.len());
        Ok(())
    }

    pub async fn unseal(&self, sandbox_name: &str) -> Result<Option<Value>> {
        let path = self.path_for(sandbox_name)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_err(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| storage_err(&path, err))
    }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| storage_err(dir, err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|err| storage_err(dir, err))?;
    }
    Ok(())
}
