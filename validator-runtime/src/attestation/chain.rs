//! Signing-chain and report-signature verification.

use std::path::Path;

use ring::signature::{
    ECDSA_P256_SHA256_ASN1, ECDSA_P384_SHA384_ASN1, RSA_PKCS1_2048_8192_SHA256,
    UnparsedPublicKey, VerificationAlgorithm,
};
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::error::{Result, SandboxError};

/// Uncompressed SEC1 point lengths.
const P256_POINT_LEN: usize = 65;
const P384_POINT_LEN: usize = 97;

/// The pinned root every report-signing chain must terminate at. Loaded once
/// at startup; never taken from a service response.
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    root_der: Vec<u8>,
}

impl TrustAnchor {
    /// Use the first certificate in `pem`.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let first = Pem::iter_from_buffer(pem)
            .next()
            .ok_or_else(|| SandboxError::Validation("no certificate in root PEM".into()))?
            .map_err(|err| SandboxError::Validation(format!("invalid root PEM: {err}")))?;
        X509Certificate::from_der(&first.contents)
            .map_err(|err| SandboxError::Validation(format!("invalid root certificate: {err}")))?;
        Ok(Self {
            root_der: first.contents,
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let pem = tokio::fs::read(path).await.map_err(|err| {
            SandboxError::Validation(format!(
                "failed to read root certificate {}: {err}",
                path.display()
            ))
        })?;
        Self::from_pem(&pem)
    }

    /// Verify `chain_pem` (leaf first) up to the pinned root and return the
    /// leaf certificate's DER.
    ///
    /// Each certificate must be within its validity window and signed by the
    /// next one. The last certificate must either be the root itself or be
    /// signed by it.
    pub fn verify_chain(&self, chain_pem: &str) -> std::result::Result<Vec<u8>, String> {
        let pems = Pem::iter_from_buffer(chain_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid PEM in signing chain: {err}"))?;
        if pems.is_empty() {
            return Err("empty signing chain".into());
        }

        let (_, root) = X509Certificate::from_der(&self.root_der)
            .map_err(|err| format!("invalid pinned root: {err}"))?;
        let certs = pems
            .iter()
            .map(|pem| {
                X509Certificate::from_der(&pem.contents)
                    .map(|(_, cert)| cert)
                    .map_err(|err| format!("invalid certificate in chain: {err}"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let last = certs.len() - 1;
        for (idx, cert) in certs.iter().enumerate() {
            let subject = cert.subject().to_string();
            if !cert.validity().is_valid() {
                return Err(format!("certificate '{subject}' is outside its validity period"));
            }

            if idx == last && pems[idx].contents == self.root_der {
                cert.verify_signature(None)
                    .map_err(|err| format!("pinned root self-signature invalid: {err}"))?;
                continue;
            }

            let issuer = if idx == last { &root } else { &certs[idx + 1] };
            if !issuer.is_ca() {
                return Err(format!("issuer '{}' is not a CA", issuer.subject()));
            }
            cert.verify_signature(Some(issuer.public_key())).map_err(|err| {
                format!(
                    "certificate '{subject}' not signed by '{}': {err}",
                    issuer.subject()
                )
            })?;
        }

        Ok(pems[0].contents.clone())
    }
}

/// Verify `signature` over `message` with the public key of `leaf_der`.
/// RSA keys use PKCS#1 v1.5 with SHA-256; EC keys use ASN.1 ECDSA.
pub fn verify_signature(
    leaf_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> std::result::Result<(), String> {
    let (_, leaf) =
        X509Certificate::from_der(leaf_der).map_err(|err| format!("invalid leaf: {err}"))?;
    let spki = leaf.public_key();
    let key = spki.subject_public_key.data.as_ref();

    let algorithm: &'static dyn VerificationAlgorithm = match spki.parsed() {
        Ok(PublicKey::RSA(_)) => &RSA_PKCS1_2048_8192_SHA256,
        Ok(PublicKey::EC(_)) => match key.len() {
            P256_POINT_LEN => &ECDSA_P256_SHA256_ASN1,
            P384_POINT_LEN => &ECDSA_P384_SHA384_ASN1,
            other => return Err(format!("unsupported EC key size ({other} bytes)")),
        },
        _ => return Err("unsupported leaf key type".into()),
    };

    UnparsedPublicKey::new(algorithm, key)
        .verify(message, signature)
        .map_err(|_| "report signature does not match leaf key".to_string())
}
