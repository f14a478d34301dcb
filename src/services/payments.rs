use crate::{
    config::AppConfig,
    entities::order::PaymentStatus,
    errors::ServiceError,
    gateway::{CreateIntentRequest, PaymentGateway},
    services::orders::{OrderService, OrderView},
};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Payment gateway adapter: drives orders through the payment lifecycle
/// against the external gateway.
#[derive(Clone)]
pub struct PaymentService {
    order_service: Arc<OrderService>,
    gateway: Arc<dyn PaymentGateway>,
    config: Arc<AppConfig>,
}

/// Payment intent handed back to the client for completing payment.
#[derive(Debug, Serialize)]
pub struct IntentView {
    pub payment_intent_id: String,
    pub client_secret: String,
}

/// Completed refund together with the updated order.
#[derive(Debug, Serialize)]
pub struct RefundView {
    pub refund_id: String,
    pub order: OrderView,
}

impl PaymentService {
    pub fn new(
        order_service: Arc<OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            order_service,
            gateway,
            config,
        }
    }

    /// Creates (or returns) the payment intent for an order.
    ///
    /// Idempotent: while an unconsumed intent exists on the order, a retried
    /// call returns it instead of creating a duplicate charge target at the
    /// gateway. The gateway call additionally carries a per-order idempotency
    /// key, so a retry after a timed-out call is safe too.
    #[instrument(skip(self))]
    pub async fn create_payment_intent(
        &self,
        order_id: Uuid,
    ) -> Result<IntentView, ServiceError> {
        let order = self.order_service.get_order_model(order_id).await?;

        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::InvalidState(format!(
                "Order {} is already paid",
                order_id
            )));
        }

        if let (Some(intent_id), Some(client_secret)) =
            (order.payment_intent_id.clone(), order.client_secret.clone())
        {
            info!(%order_id, %intent_id, "returning existing payment intent");
            return Ok(IntentView {
                payment_intent_id: intent_id,
                client_secret,
            });
        }

        let amount_minor = to_minor_units(order.total_amount, self.config.currency_minor_units)?;

        let intent = self
            .gateway
            .create_intent(CreateIntentRequest {
                amount_minor,
                currency: self.config.currency.clone(),
                order_id,
                idempotency_key: format!("order-{}", order_id),
            })
            .await?;

        self.order_service
            .record_payment_intent(order_id, &intent.id, &intent.client_secret)
            .await?;

        info!(%order_id, intent_id = %intent.id, amount_minor, "payment intent created");
        Ok(IntentView {
            payment_intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    /// Issues a full refund for a paid order and drives the refunded/cancelled
    /// transition, releasing reserved stock.
    #[instrument(skip(self))]
    pub async fn refund_payment(&self, order_id: Uuid) -> Result<RefundView, ServiceError> {
        let order = self.order_service.get_order_model(order_id).await?;

        if order.payment_status != PaymentStatus::Paid {
            return Err(ServiceError::InvalidState(format!(
                "Order {} is not paid",
                order_id
            )));
        }

        let intent_id = order.payment_intent_id.ok_or_else(|| {
            ServiceError::InvalidState(format!("Order {} has no payment details", order_id))
        })?;

        let refund = self
            .gateway
            .refund(&intent_id, &format!("refund-order-{}", order_id))
            .await?;
        let order = self.order_service.apply_refund(order_id, &refund.id).await?;

        info!(%order_id, refund_id = %refund.id, "payment refunded");
        Ok(RefundView {
            refund_id: refund.id,
            order,
        })
    }
}

/// Converts a decimal money amount into the gateway's integer minor-unit
/// format, rounding to nearest with half away from zero.
pub fn to_minor_units(amount: Decimal, minor_units: u32) -> Result<i64, ServiceError> {
    let scaled = (amount * Decimal::from(minor_units))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled.to_i64().ok_or_else(|| {
        ServiceError::InternalError(format!("amount {} out of range for gateway", amount))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn whole_amounts_convert_exactly() {
        assert_eq!(to_minor_units(dec!(20.00), 100).unwrap(), 2000);
        assert_eq!(to_minor_units(dec!(0.01), 100).unwrap(), 1);
        assert_eq!(to_minor_units(dec!(1234.56), 100).unwrap(), 123456);
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(to_minor_units(dec!(19.995), 100).unwrap(), 2000);
        assert_eq!(to_minor_units(dec!(19.994), 100).unwrap(), 1999);
        assert_eq!(to_minor_units(dec!(0.005), 100).unwrap(), 1);
    }

    #[test]
    fn zero_decimal_currencies_use_unit_divisor() {
        // e.g. JPY with a divisor of 1
        assert_eq!(to_minor_units(dec!(500), 1).unwrap(), 500);
        assert_eq!(to_minor_units(dec!(499.5), 1).unwrap(), 500);
    }
}
