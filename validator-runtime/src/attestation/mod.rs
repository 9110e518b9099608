//! Remote attestation for hardware-isolated sandboxes.
//!
//! [`AttestationVerifier::verify`] runs four gates in order, each a hard stop:
//!
//! 1. obtain a quote from the sandbox ([`QuoteSource`])
//! 2. submit it to the attestation service ([`AttestationService`])
//! 3. check the report signature against the signing chain, which must end
//!    at the pinned [`TrustAnchor`]
//! 4. check the quote status and, if supplied, the expected measurement
//!
//! The result is always an explicit [`TrustDecision`]; gate failures never
//! escape as errors.

pub mod chain;
pub mod ias;
pub mod quote;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AttestationErrorKind, Result};
use crate::metrics::PoolMetrics;
use crate::sandbox::Sandbox;

pub use chain::TrustAnchor;
pub use ias::IasClient;
pub use quote::{FileQuoteSource, HttpQuoteSource};

/// Quote status the service reports for a genuine, up-to-date enclave.
pub const QUOTE_STATUS_OK: &str = "OK";

/// Byte range of MRENCLAVE within the quote body.
const MRENCLAVE_RANGE: std::ops::Range<usize> = 112..144;

/// Raw hardware-signed quote. Fetched fresh for every verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationQuote(pub Vec<u8>);

/// What the attestation service returned, before any checking.
#[derive(Clone, Debug)]
pub struct ServiceResponse {
    /// Report body exactly as received; the signature covers these bytes.
    pub report: String,
    /// Base64 signature over `report`.
    pub signature: String,
    /// PEM certificates, leaf first.
    pub cert_chain: String,
}

/// Authenticated report fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationReport {
    pub quote_status: String,
    /// Lowercase hex MRENCLAVE; empty if the report carried no quote body.
    pub measurement: String,
    pub signature: Vec<u8>,
    pub signing_cert_chain: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustDecision {
    pub valid: bool,
    pub reason: Option<AttestationErrorKind>,
}

impl TrustDecision {
    fn trusted() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: AttestationErrorKind) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch(&self, sandbox: &Sandbox) -> Result<AttestationQuote>;
}

#[async_trait::async_trait]
pub trait AttestationService: Send + Sync {
    async fn submit(&self, quote: &AttestationQuote, credential: &str) -> Result<ServiceResponse>;
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(rename = "isvEnclaveQuoteStatus")]
    quote_status: Option<String>,
    #[serde(rename = "isvEnclaveQuoteBody")]
    quote_body: Option<String>,
}

/// Extract MRENCLAVE from a base64 quote body.
fn measurement_from_body(body: &str) -> String {
    BASE64
        .decode(body.trim())
        .ok()
        .and_then(|bytes| bytes.get(MRENCLAVE_RANGE).map(hex::encode))
        .unwrap_or_default()
}

/// Gate 3: authenticate the response and decode the report it carries.
pub fn authenticate(
    anchor: &TrustAnchor,
    response: &ServiceResponse,
) -> std::result::Result<AttestationReport, AttestationErrorKind> {
    let invalid = |detail: String| AttestationErrorKind::SignatureInvalid { detail };

    let signature = BASE64
        .decode(response.signature.trim())
        .map_err(|err| invalid(format!("signature is not base64: {err}")))?;
    let leaf = anchor.verify_chain(&response.cert_chain).map_err(invalid)?;
    chain::verify_signature(&leaf, response.report.as_bytes(), &signature).map_err(invalid)?;

    let raw: RawReport = serde_json::from_str(&response.report)
        .map_err(|err| invalid(format!("signed report is not valid JSON: {err}")))?;

    Ok(AttestationReport {
        quote_status: raw.quote_status.unwrap_or_default(),
        measurement: raw
            .quote_body
            .as_deref()
            .map(measurement_from_body)
            .unwrap_or_default(),
        signature,
        signing_cert_chain: response.cert_chain.clone(),
    })
}

/// Gate 4: quote status and measurement.
pub fn check_semantics(
    report: &AttestationReport,
    expected_measurement: Option<&str>,
) -> std::result::Result<(), AttestationErrorKind> {
    if !report.quote_status.eq_ignore_ascii_case(QUOTE_STATUS_OK) {
        return Err(AttestationErrorKind::StatusNotOk {
            status: report.quote_status.clone(),
        });
    }
    if let Some(expected) = expected_measurement {
        let expected = expected.trim();
        // A blank expectation or a report without a quote body never matches.
        if expected.is_empty()
            || report.measurement.is_empty()
            || !expected.eq_ignore_ascii_case(&report.measurement)
        {
            return Err(AttestationErrorKind::MeasurementMismatch {
                expected: expected.to_ascii_lowercase(),
                actual: report.measurement.clone(),
            });
        }
    }
    Ok(())
}

pub struct AttestationVerifier {
    quotes: Arc<dyn QuoteSource>,
    service: Arc<dyn AttestationService>,
    credential: String,
    anchor: TrustAnchor,
    metrics: Option<Arc<PoolMetrics>>,
}

impl AttestationVerifier {
    pub fn new(
        quotes: Arc<dyn QuoteSource>,
        service: Arc<dyn AttestationService>,
        credential: impl Into<String>,
        anchor: TrustAnchor,
    ) -> Self {
        Self {
            quotes,
            service,
            credential: credential.into(),
            anchor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PoolMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn verify(&self, sandbox: &Sandbox, expected_measurement: Option<&str>) -> TrustDecision {
        let decision = match self.run_gates(sandbox, expected_measurement).await {
            Ok(report) => {
                info!(
                    "attestation: {} trusted (measurement {})",
                    sandbox.name, report.measurement
                );
                TrustDecision::trusted()
            }
            Err(reason) => {
                warn!("attestation: {} rejected: {reason}", sandbox.name);
                TrustDecision::rejected(reason)
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_attestation(decision.valid);
        }
        decision
    }

    async fn run_gates(
        &self,
        sandbox: &Sandbox,
        expected_measurement: Option<&str>,
    ) -> std::result::Result<AttestationReport, AttestationErrorKind> {
        let quote = self
            .quotes
            .fetch(sandbox)
            .await
            .map_err(|err| AttestationErrorKind::QuoteUnavailable {
                detail: err.to_string(),
            })?;
        if quote.0.is_empty() {
            return Err(AttestationErrorKind::QuoteUnavailable {
                detail: "empty quote".into(),
            });
        }

        let response = self
            .service
            .submit(&quote, &self.credential)
            .await
            .map_err(|err| AttestationErrorKind::ServiceUnreachable {
                detail: err.to_string(),
            })?;

        let report = authenticate(&self.anchor, &response)?;
        check_semantics(&report, expected_measurement)?;
        Ok(report)
    }
}
