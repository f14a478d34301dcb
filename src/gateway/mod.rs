//! Outbound payment gateway seam.
//!
//! Services talk to [`PaymentGateway`]; production wires in the Stripe HTTP
//! client, tests substitute a recording mock.

mod stripe;

pub use stripe::StripeGateway;

use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

/// Request to create a payment intent at the gateway.
#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    /// Amount in the gateway's integer minor-unit format (e.g. cents).
    pub amount_minor: i64,
    pub currency: String,
    /// Order id carried in gateway metadata so webhook events can be
    /// reconciled back to the order.
    pub order_id: Uuid,
    /// Per-order idempotency key; retries with the same key must not create a
    /// second charge target.
    pub idempotency_key: String,
}

/// Gateway-side payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayIntent {
    pub id: String,
    pub client_secret: String,
}

/// Gateway-side refund.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub status: String,
}

/// External payment gateway operations used by the payment service.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a payment intent. Safe to retry with the same idempotency key.
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, ServiceError>;

    /// Issues a full refund against a payment intent. Single attempt, never
    /// blindly retried; the per-order idempotency key keeps concurrent
    /// duplicates from creating a second refund at the gateway.
    async fn refund(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, ServiceError>;
}
