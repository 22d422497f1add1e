use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::{
    ChargeRef, GatewayError, HoldRef, OpenHoldRequest, PaymentGateway, PaymentState, RefundRef,
    RefundRequest, ReleaseRef, TransferRef, TransferRequest,
};

/// HTTP client for the processor's REST API. Constructed once at bootstrap and
/// passed into the engine; there is no ambient client singleton.
#[derive(Debug, Clone)]
pub struct RestPaymentGateway {
    base_url: String,
    secret_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct HoldResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CaptureResponse {
    charge_ref: String,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    release_ref: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentStateResponse {
    status: String,
    charge_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

impl RestPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Transient(format!("client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            client,
        })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<T, GatewayError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request.send().await.map_err(classify_transport_error)?;
        decode_response(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(classify_transport_error)?;
        decode_response(response).await
    }
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        // The request may have reached the processor; outcome unknown.
        GatewayError::AmbiguousOutcome(format!("request timed out: {err}"))
    } else if err.is_connect() {
        GatewayError::Transient(format!("connect failed: {err}"))
    } else {
        GatewayError::AmbiguousOutcome(err.to_string())
    }
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, GatewayError> {
    let status = response.status();
    if status.is_success() {
        // A 2xx means the call took effect; a decode failure afterwards is an
        // unknown outcome, not a clean failure.
        return response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::AmbiguousOutcome(format!("response decode failed: {e}")));
    }

    let body = response.json::<ApiErrorBody>().await.ok();
    let (code, message) = body
        .and_then(|b| b.error)
        .map(|e| {
            (
                e.code.unwrap_or_else(|| status.as_u16().to_string()),
                e.message.unwrap_or_default(),
            )
        })
        .unwrap_or_else(|| (status.as_u16().to_string(), String::new()));

    if status.is_server_error() || status.as_u16() == 429 {
        Err(GatewayError::Transient(format!(
            "http {status}: {code}: {message}"
        )))
    } else {
        Err(GatewayError::Rejected { code, message })
    }
}

fn parse_payment_state(raw: PaymentStateResponse) -> Result<PaymentState, GatewayError> {
    match raw.status.as_str() {
        "requires_capture" => Ok(PaymentState::RequiresCapture),
        "captured" => {
            let charge_ref = raw.charge_ref.ok_or_else(|| {
                GatewayError::AmbiguousOutcome(
                    "captured state without charge reference".to_string(),
                )
            })?;
            Ok(PaymentState::Captured {
                charge_ref: ChargeRef(charge_ref),
            })
        }
        "canceled" => Ok(PaymentState::Canceled),
        "failed" => Ok(PaymentState::Failed),
        other => Err(GatewayError::AmbiguousOutcome(format!(
            "unknown payment state {other}"
        ))),
    }
}

#[async_trait]
impl PaymentGateway for RestPaymentGateway {
    async fn open_hold(&self, request: &OpenHoldRequest) -> Result<HoldRef, GatewayError> {
        let body = serde_json::json!({
            "amount": request.amount,
            "currency": request.currency,
            "capture_method": "manual",
            "metadata": { "bet_id": request.bet_id },
        });
        let response: HoldResponse = self
            .post_json("/v1/holds", &body, Some(&request.idempotency_key))
            .await?;
        Ok(HoldRef(response.id))
    }

    async fn capture_hold(&self, hold_ref: &HoldRef) -> Result<ChargeRef, GatewayError> {
        let response: CaptureResponse = self
            .post_json(
                &format!("/v1/holds/{hold_ref}/capture"),
                &Value::Null,
                None,
            )
            .await?;
        Ok(ChargeRef(response.charge_ref))
    }

    async fn cancel_hold(&self, hold_ref: &HoldRef) -> Result<ReleaseRef, GatewayError> {
        let response: CancelResponse = self
            .post_json(&format!("/v1/holds/{hold_ref}/cancel"), &Value::Null, None)
            .await?;
        Ok(ReleaseRef(response.release_ref))
    }

    async fn refund_charge(&self, request: &RefundRequest) -> Result<RefundRef, GatewayError> {
        let body = serde_json::json!({
            "charge": request.charge_ref,
            "amount": request.amount,
            "metadata": { "bet_id": request.bet_id, "type": "bet_success_refund" },
        });
        let response: RefundResponse = self
            .post_json("/v1/refunds", &body, Some(&request.idempotency_key))
            .await?;
        Ok(RefundRef(response.id))
    }

    async fn transfer_from_charge(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferRef, GatewayError> {
        let body = serde_json::json!({
            "amount": request.amount,
            "destination": request.destination,
            "source_charge": request.charge_ref,
            "metadata": request.metadata,
        });
        let response: TransferResponse = self
            .post_json("/v1/transfers", &body, Some(&request.idempotency_key))
            .await?;
        Ok(TransferRef(response.id))
    }

    async fn get_payment_state(&self, hold_ref: &HoldRef) -> Result<PaymentState, GatewayError> {
        let response: PaymentStateResponse =
            self.get_json(&format!("/v1/holds/{hold_ref}")).await?;
        parse_payment_state(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_state_parser_maps_known_statuses() {
        let captured = parse_payment_state(PaymentStateResponse {
            status: "captured".to_string(),
            charge_ref: Some("ch_1".to_string()),
        })
        .expect("parse");
        assert_eq!(
            captured,
            PaymentState::Captured {
                charge_ref: ChargeRef("ch_1".to_string())
            }
        );

        assert_eq!(
            parse_payment_state(PaymentStateResponse {
                status: "requires_capture".to_string(),
                charge_ref: None,
            })
            .expect("parse"),
            PaymentState::RequiresCapture
        );
    }

    #[test]
    fn captured_state_without_charge_ref_is_ambiguous() {
        let err = parse_payment_state(PaymentStateResponse {
            status: "captured".to_string(),
            charge_ref: None,
        })
        .expect_err("missing charge ref");
        assert!(matches!(err, GatewayError::AmbiguousOutcome(_)));
    }

    #[test]
    fn unknown_state_is_not_silently_mapped() {
        let err = parse_payment_state(PaymentStateResponse {
            status: "definitely_new".to_string(),
            charge_ref: None,
        })
        .expect_err("unknown state");
        assert!(matches!(err, GatewayError::AmbiguousOutcome(_)));
    }
}
