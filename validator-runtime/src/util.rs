use once_cell::sync::OnceCell;
use reqwest::Client;

use crate::error::{Result, SandboxError};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared HTTP client. Deadlines are applied per request, not here.
pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT.get_or_try_init(|| {
        Client::builder()
            .build()
            .map_err(|err| SandboxError::Provider(format!("Failed to build HTTP client: {err}")))
    })
}

pub fn elapsed_ms(start: std::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
