//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256>`, where the MAC
//! covers `"{t}.{raw body}"`. Comparison is constant-time and the timestamp
//! must be within the configured tolerance of the local clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hex::FromHex;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::trigger::{VerifiedEvent, WebhookEvent};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,

    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        self.verify_at(payload, header, Utc::now())
    }

    pub fn verify_at(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let header = header.ok_or(SignatureError::Missing)?;
        let (timestamp, signatures) = parse_header(header)?;

        let skew = (now.timestamp() - timestamp).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            return Err(SignatureError::Expired);
        }

        let expected = self.mac(timestamp, payload)?;
        let matched = signatures
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));

        if matched {
            Ok(())
        } else {
            Err(SignatureError::VerificationFailed)
        }
    }

    /// Verify, then decode. The only way to obtain a [`VerifiedEvent`].
    pub fn verify_event(&self, payload: &[u8], header: Option<&str>) -> Result<VerifiedEvent, SignatureError> {
        self.verify(payload, header)?;
        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| SignatureError::InvalidPayload(e.to_string()))?;
        Ok(VerifiedEvent::new(event))
    }

    /// Header value for `payload` signed at `timestamp` (used by tests and tooling).
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let mac = self.mac(timestamp, payload)?;
        Ok(format!("t={timestamp},v1={}", hex::encode(mac)))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| SignatureError::InvalidFormat(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn parse_header(header: &str) -> Result<(i64, Vec<Vec<u8>>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::InvalidFormat(format!("malformed element: {part}")));
        };
        match key {
            "t" => {
                let t = value
                    .parse::<i64>()
                    .map_err(|e| SignatureError::InvalidFormat(format!("bad timestamp: {e}")))?;
                timestamp = Some(t);
            }
            "v1" => {
                let bytes = <Vec<u8>>::from_hex(value)
                    .map_err(|e| SignatureError::InvalidFormat(format!("bad hex signature: {e}")))?;
                signatures.push(bytes);
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::InvalidFormat("missing t=".into()))?;
    if signatures.is_empty() {
        return Err(SignatureError::InvalidFormat("missing v1=".into()));
    }
    Ok((timestamp, signatures))
}
