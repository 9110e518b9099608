//! Quote sources.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use super::{AttestationQuote, QuoteSource};
use crate::error::{AttestationErrorKind, Result, SandboxError};
use crate::sandbox::Sandbox;
use crate::util::http_client;

pub const QUOTE_PATH: &str = "/attestation/quote";

fn unavailable(detail: impl Into<String>) -> SandboxError {
    SandboxError::Attestation(AttestationErrorKind::QuoteUnavailable {
        detail: detail.into(),
    })
}

#[derive(Deserialize)]
struct QuoteReply {
    quote: String,
}

/// Asks the sandbox's task handler for a fresh quote:
/// `GET /attestation/quote` → `{"quote": "<base64>"}`.
pub struct HttpQuoteSource {
    timeout: Duration,
}

impl HttpQuoteSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch(&self, sandbox: &Sandbox) -> Result<AttestationQuote> {
        let base = sandbox
            .endpoint
            .base_url()
            .ok_or_else(|| unavailable(format!("{} has no HTTP endpoint", sandbox.name)))?;
        let url = format!("{base}{QUOTE_PATH}");

        let response = http_client()?
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| unavailable(format!("GET {url} failed: {err}")))?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let reply: QuoteReply = response
            .json()
            .await
            .map_err(|err| unavailable(format!("invalid quote reply: {err}")))?;
        let bytes = BASE64
            .decode(reply.quote.trim())
            .map_err(|err| unavailable(format!("quote is not base64: {err}")))?;
        Ok(AttestationQuote(bytes))
    }
}

/// Reads a raw quote from a local file, for verifiers co-located with the
/// enclave.
pub struct FileQuoteSource {
    path: PathBuf,
}

impl FileQuoteSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl QuoteSource for FileQuoteSource {
    async fn fetch(&self, _sandbox: &Sandbox) -> Result<AttestationQuote> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| unavailable(format!("{}: {err}", self.path.display())))?;
        Ok(AttestationQuote(bytes))
    }
}
