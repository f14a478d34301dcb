use crate::{
    entities::{webhook_event, WebhookEvent},
    errors::ServiceError,
    events::Event,
    services::orders::PaymentApplied,
    AppState,
};
use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::{sea_query::OnConflict, ActiveValue::Set, EntityTrait};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(payment_webhook))
}

/// POST /payments/webhook
///
/// Verifies the gateway signature over the raw body, then applies the event
/// to order state. Redelivered events are no-ops; unknown event types are
/// accepted and ignored.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if !verify_signature(
        &headers,
        &body,
        &state.config.webhook_secret,
        state.config.webhook_tolerance_secs,
    ) {
        warn!("webhook signature verification failed");
        return Err(ServiceError::SignatureInvalid);
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook json: {}", e)))?;

    let event_id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let event_type = payload
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    // Fast-path skip for events already fully processed. The durable record
    // is only written after successful processing, so a crash in between
    // leads to a redelivery, which the state-machine guard absorbs.
    if !event_id.is_empty() {
        if WebhookEvent::find_by_id(event_id.clone())
            .one(&*state.db)
            .await?
            .is_some()
        {
            info!(%event_id, "webhook event already processed");
            return Ok(Json(json!({ "received": true })));
        }
    }

    let order_id = match event_type.as_str() {
        "payment_intent.succeeded" => {
            let order_id = extract_order_id(&payload).ok_or_else(|| {
                ServiceError::ValidationError("event missing metadata.order_id".to_string())
            })?;

            match state.services.orders.mark_paid(order_id).await {
                Ok(PaymentApplied::Applied) => {
                    info!(%event_id, %order_id, "payment confirmation applied");
                }
                Ok(PaymentApplied::AlreadyPaid) | Ok(PaymentApplied::Ignored) => {
                    info!(%event_id, %order_id, "payment confirmation was a no-op");
                }
                Err(ServiceError::NotFound(_)) => {
                    // Cannot be retried transparently by the gateway; logged
                    // with identifiers for manual reconciliation.
                    warn!(%event_id, %order_id, "webhook references unknown order");
                }
                Err(e) => return Err(e),
            }
            Some(order_id)
        }
        other => {
            info!(%event_id, event_type = other, "ignoring unhandled webhook event type");
            None
        }
    };

    if !event_id.is_empty() {
        let record = webhook_event::ActiveModel {
            id: Set(event_id.clone()),
            event_type: Set(event_type.clone()),
            order_id: Set(order_id),
            received_at: Set(Utc::now()),
        };
        // A concurrent delivery may have recorded it first; that is fine.
        let _ = WebhookEvent::insert(record)
            .on_conflict(
                OnConflict::column(webhook_event::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*state.db)
            .await?;

        state
            .event_sender
            .send_or_log(Event::WebhookProcessed {
                event_id,
                event_type,
            })
            .await;
    }

    Ok(Json(json!({ "received": true })))
}

fn extract_order_id(payload: &Value) -> Option<Uuid> {
    payload
        .pointer("/data/object/metadata/order_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Verifies a `Stripe-Signature`-style header: `t=<unix ts>,v1=<hex hmac>`,
/// where the signed payload is `"{t}.{raw body}"`.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> bool {
    let Some(header) = headers
        .get("stripe-signature")
        .or_else(|| headers.get("signature"))
        .and_then(|h| h.to_str().ok())
    else {
        return false;
    };

    let mut timestamp = "";
    let mut signature = "";
    for part in header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => timestamp = val,
            (Some("v1"), Some(val)) => signature = val,
            _ => {}
        }
    }
    if timestamp.is_empty() || signature.is_empty() {
        return false;
    }

    if let Ok(ts) = timestamp.parse::<i64>() {
        let now = Utc::now().timestamp();
        if (now - ts).unsigned_abs() > tolerance_secs {
            return false;
        }
    } else {
        return false;
    }

    let expected = sign_payload(timestamp, payload, secret);
    constant_time_eq(&expected, signature)
}

/// Computes the hex HMAC-SHA256 signature the gateway would send.
pub fn sign_payload(timestamp: &str, payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signed_headers(body: &[u8], secret: &str, ts: i64) -> HeaderMap {
        let ts = ts.to_string();
        let sig = sign_payload(&ts, body, secret);
        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_str(&format!("t={},v1={}", ts, sig)).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed_headers(body, "whsec_test", Utc::now().timestamp());
        assert!(verify_signature(&headers, body, "whsec_test", 300));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed_headers(body, "whsec_other", Utc::now().timestamp());
        assert!(!verify_signature(&headers, body, "whsec_test", 300));
    }

    #[test]
    fn tampered_body_fails() {
        let headers = signed_headers(br#"{"id":"evt_1"}"#, "whsec_test", Utc::now().timestamp());
        assert!(!verify_signature(
            &headers,
            br#"{"id":"evt_2"}"#,
            "whsec_test",
            300
        ));
    }

    #[test]
    fn stale_timestamp_fails() {
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed_headers(body, "whsec_test", Utc::now().timestamp() - 3600);
        assert!(!verify_signature(&headers, body, "whsec_test", 300));
    }

    #[test]
    fn missing_header_fails() {
        assert!(!verify_signature(&HeaderMap::new(), b"{}", "whsec_test", 300));
    }

    #[test]
    fn order_id_is_read_from_event_metadata() {
        let id = Uuid::new_v4();
        let payload = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_1", "metadata": { "order_id": id.to_string() } } }
        });
        assert_eq!(extract_order_id(&payload), Some(id));
        assert_eq!(extract_order_id(&json!({"data": {}})), None);
    }
}
