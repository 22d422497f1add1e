use bet_domain::{Amount, BetId, GatewayEvent, GatewayEventKind};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age (and future skew) of a signed event, in seconds.
const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("signature header is missing the timestamp element")]
    MissingTimestamp,
    #[error("signature header is missing the signature element")]
    MissingSignature,
    #[error("signature header timestamp is not a unix epoch integer")]
    InvalidTimestamp,
    #[error("signed timestamp outside tolerance window")]
    TimestampOutOfTolerance,
    #[error("signature is not valid hex")]
    InvalidSignatureEncoding,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("malformed event payload: {0}")]
    MalformedPayload(String),
    #[error("unsupported event type {0}")]
    UnsupportedEventType(String),
}

/// Verifies the processor's `t=<unix>,v1=<hex hmac>` signature scheme: the MAC
/// is HMAC-SHA256 over `"{t}.{payload}"` keyed with the endpoint's signing
/// secret. Verification happens before the payload is even parsed.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    signing_secret: Vec<u8>,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    #[must_use]
    pub fn new(signing_secret: impl AsRef<[u8]>) -> Self {
        Self {
            signing_secret: signing_secret.as_ref().to_vec(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    #[must_use]
    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<(), WebhookError> {
        self.verify_at(payload, signature_header, Utc::now())
    }

    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let mut timestamp: Option<&str> = None;
        let mut signature: Option<&str> = None;
        for element in signature_header.split(',') {
            match element.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(WebhookError::MissingTimestamp)?;
        let signature = signature.ok_or(WebhookError::MissingSignature)?;

        let epoch: i64 = timestamp
            .parse()
            .map_err(|_| WebhookError::InvalidTimestamp)?;
        let signed_at = Utc
            .timestamp_opt(epoch, 0)
            .single()
            .ok_or(WebhookError::InvalidTimestamp)?;
        if (now - signed_at).num_seconds().abs() > self.tolerance_secs {
            return Err(WebhookError::TimestampOutOfTolerance);
        }

        let provided =
            hex::decode(signature).map_err(|_| WebhookError::InvalidSignatureEncoding)?;
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|_| WebhookError::SignatureMismatch)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&provided)
            .map_err(|_| WebhookError::SignatureMismatch)
    }
}

#[derive(Debug, Deserialize)]
struct RawEventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    bet_id: Option<BetId>,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct HoldData {
    hold_ref: String,
}

#[derive(Debug, Deserialize)]
struct CaptureData {
    hold_ref: String,
    charge_ref: String,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    charge_ref: String,
    refund_ref: String,
    amount: Amount,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    transfer_ref: String,
    amount: Amount,
}

fn data<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, WebhookError> {
    serde_json::from_value(value).map_err(|e| WebhookError::MalformedPayload(e.to_string()))
}

/// Parses a verified payload into the closed event enum. An event type this
/// build does not know is an explicit `UnsupportedEventType`, which the
/// reconciler logs and drops; it is never dispatched blind.
pub fn parse_gateway_event(payload: &[u8]) -> Result<GatewayEvent, WebhookError> {
    let raw: RawEventEnvelope = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    let kind = match raw.event_type.as_str() {
        "checkout_completed" => {
            let d: HoldData = data(raw.data)?;
            GatewayEventKind::CheckoutCompleted {
                hold_ref: d.hold_ref,
            }
        }
        "hold_captured" => {
            let d: CaptureData = data(raw.data)?;
            GatewayEventKind::HoldCaptured {
                hold_ref: d.hold_ref,
                charge_ref: d.charge_ref,
            }
        }
        "capture_failed" => {
            let d: HoldData = data(raw.data)?;
            GatewayEventKind::CaptureFailed {
                hold_ref: d.hold_ref,
            }
        }
        "hold_canceled" => {
            let d: HoldData = data(raw.data)?;
            GatewayEventKind::HoldCanceled {
                hold_ref: d.hold_ref,
            }
        }
        "refund_issued" => {
            let d: RefundData = data(raw.data)?;
            GatewayEventKind::RefundIssued {
                charge_ref: d.charge_ref,
                refund_ref: d.refund_ref,
                amount: d.amount,
            }
        }
        "transfer_created" => {
            let d: TransferData = data(raw.data)?;
            GatewayEventKind::TransferCreated {
                transfer_ref: d.transfer_ref,
                amount: d.amount,
            }
        }
        other => return Err(WebhookError::UnsupportedEventType(other.to_string())),
    };

    let occurred_at = Utc
        .timestamp_opt(raw.created, 0)
        .single()
        .ok_or(WebhookError::MalformedPayload("invalid created epoch".to_string()))?;

    Ok(GatewayEvent {
        event_id: raw.id,
        bet_id: raw.bet_id,
        occurred_at,
        kind,
    })
}
