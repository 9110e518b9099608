//! Intel Attestation Service (EPID) client.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::HeaderMap;
use serde_json::json;
use tracing::debug;

use super::{AttestationQuote, AttestationService, ServiceResponse};
use crate::error::{AttestationErrorKind, Result, SandboxError};
use crate::util::http_client;

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const SIGNATURE_HEADER: &str = "X-IASReport-Signature";
pub const CERT_CHAIN_HEADER: &str = "X-IASReport-Signing-Certificate";
pub const REPORT_PATH: &str = "/report";

fn unreachable(detail: impl Into<String>) -> SandboxError {
    SandboxError::Attestation(AttestationErrorKind::ServiceUnreachable {
        detail: detail.into(),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub struct IasClient {
    base_url: String,
    timeout: Duration,
}

impl IasClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl AttestationService for IasClient {
    /// Missing signature or chain headers are passed through empty; the
    /// signature gate rejects them.
    async fn submit(&self, quote: &AttestationQuote, credential: &str) -> Result<ServiceResponse> {
        let url = format!("{}{REPORT_PATH}", self.base_url);
        debug!("ias: submitting {}-byte quote to {url}", quote.0.len());

        let response = http_client()?
            .post(&url)
            .timeout(self.timeout)
            .header(SUBSCRIPTION_KEY_HEADER, credential)
            .json(&json!({ "isvEnclaveQuote": BASE64.encode(&quote.0) }))
            .send()
            .await
            .map_err(|err| unreachable(format!("POST {url} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("{url} returned {status}")));
        }

        let headers = response.headers().clone();
        let signature = header_value(&headers, SIGNATURE_HEADER);
        let cert_chain = urlencoding::decode(&header_value(&headers, CERT_CHAIN_HEADER))
            .map_err(|err| unreachable(format!("undecodable signing chain header: {err}")))?
            .into_owned();
        let report = response
            .text()
            .await
            .map_err(|err| unreachable(format!("failed to read report body: {err}")))?;

        Ok(ServiceResponse {
            report,
            signature,
            cert_chain,
        })
    }
}
