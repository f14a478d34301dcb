use crate::{
    config::AppConfig,
    entities::{
        cart, cart_item,
        order::{self, OrderStatus, PaymentStatus},
        order_item, Cart, CartItem, Order, OrderItem, Product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::inventory::InventoryService,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Order builder: converts carts into immutably priced orders and drives them
/// through the status state machine.
///
/// Transitions are per-order conditional updates keyed on the current
/// `(status, payment_status)` pair; of two concurrent attempts only one can
/// match, so the loser observes zero affected rows and maps that to
/// `Conflict`, `InvalidState` or an idempotent no-op depending on the
/// operation.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    config: Arc<AppConfig>,
}

/// Result of applying a gateway payment confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentApplied {
    /// The order moved to processing/paid.
    Applied,
    /// The order was already paid; redelivery is a no-op.
    AlreadyPaid,
    /// The order is in a terminal state (cancelled/refunded); the event is
    /// accepted and ignored rather than resurrecting `paid`.
    Ignored,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Commits the user's cart into an order.
    ///
    /// One transaction covers reading the cart, reserving stock per item,
    /// writing the order and its priced item snapshots, and clearing the cart.
    /// Any failure, including a single item's stock shortfall, rolls back every
    /// reservation already taken, so multi-item orders reserve all or nothing.
    #[instrument(skip(self))]
    pub async fn create_order(&self, user_id: Uuid) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InvalidState("Cart is empty".to_string()))?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&txn)
            .await?;
        if items.is_empty() {
            return Err(ServiceError::InvalidState("Cart is empty".to_string()));
        }

        let reservations: Vec<(Uuid, i32)> = items
            .iter()
            .map(|item| (item.product_id, item.quantity))
            .collect();
        InventoryService::reserve_all_on(&txn, &reservations).await?;

        let total: Decimal = items
            .iter()
            .map(|item| item.price_snapshot * Decimal::from(item.quantity))
            .sum();

        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            total_amount: Set(total),
            currency: Set(self.config.currency.clone()),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Unpaid),
            payment_intent_id: Set(None),
            client_secret: Set(None),
            refund_id: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };
        let order = order.insert(&txn).await?;

        let mut order_items = Vec::with_capacity(items.len());
        for item in &items {
            let name = Product::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .map(|p| p.name)
                .unwrap_or_default();
            let line = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                name: Set(name),
                quantity: Set(item.quantity),
                unit_price: Set(item.price_snapshot),
                line_total: Set(item.price_snapshot * Decimal::from(item.quantity)),
            };
            order_items.push(line.insert(&txn).await?);
        }

        // Clear the cart, guarded by its version: a concurrent cart mutation
        // during checkout aborts the whole order instead of losing the edit.
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        let cleared = Cart::update_many()
            .col_expr(cart::Column::TotalAmount, Expr::value(Decimal::ZERO))
            .col_expr(cart::Column::Version, Expr::value(cart.version + 1))
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::Id.eq(cart.id))
            .filter(cart::Column::Version.eq(cart.version))
            .exec(&txn)
            .await?;
        if cleared.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(format!(
                "Cart {} was modified concurrently",
                cart.id
            )));
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCreated(order_id))
            .await;
        for (product_id, quantity) in reservations {
            self.event_sender
                .send_or_log(Event::StockReserved {
                    product_id,
                    quantity,
                })
                .await;
        }

        info!(%order_id, %user_id, %total, "order created from cart");
        Ok(OrderView {
            order,
            items: order_items,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let order = self.get_order_model(order_id).await?;
        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(OrderView { order, items })
    }

    pub async fn get_order_model(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Lists a user's orders, newest first.
    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<order::Model>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Stores the gateway payment intent on a still-unpaid order.
    pub async fn record_payment_intent(
        &self,
        order_id: Uuid,
        intent_id: &str,
        client_secret: &str,
    ) -> Result<(), ServiceError> {
        let result = Order::update_many()
            .col_expr(
                order::Column::PaymentIntentId,
                Expr::value(Some(intent_id.to_string())),
            )
            .col_expr(
                order::Column::ClientSecret,
                Expr::value(Some(client_secret.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidState(format!(
                "Order {} is not awaiting payment",
                order_id
            )));
        }

        self.event_sender
            .send_or_log(Event::PaymentIntentCreated {
                order_id,
                intent_id: intent_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Applies a gateway payment confirmation: unpaid → paid, status →
    /// processing.
    ///
    /// Idempotent for redelivered events and a strict no-op for terminal
    /// orders, so a `succeeded` event arriving after a refund can never
    /// resurrect `paid`.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, order_id: Uuid) -> Result<PaymentApplied, ServiceError> {
        let result = Order::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(PaymentStatus::Paid),
            )
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Processing))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .filter(
                order::Column::Status
                    .is_in([OrderStatus::Pending, OrderStatus::Processing]),
            )
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 1 {
            self.event_sender.send_or_log(Event::OrderPaid(order_id)).await;
            info!(%order_id, "payment confirmed");
            return Ok(PaymentApplied::Applied);
        }

        // Zero rows: decide between not-found, duplicate delivery and a
        // terminal order.
        let order = self.get_order_model(order_id).await?;
        if order.payment_status == PaymentStatus::Paid {
            info!(%order_id, "payment already recorded; ignoring duplicate");
            Ok(PaymentApplied::AlreadyPaid)
        } else {
            warn!(%order_id, status = ?order.status, "payment event for terminal order ignored");
            Ok(PaymentApplied::Ignored)
        }
    }

    /// Applies a completed refund: paid → refunded, status → cancelled, and
    /// releases reserved stock for every item.
    #[instrument(skip(self))]
    pub async fn apply_refund(
        &self,
        order_id: Uuid,
        refund_id: &str,
    ) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;

        let result = Order::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(PaymentStatus::Refunded),
            )
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(
                order::Column::RefundId,
                Expr::value(Some(refund_id.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Paid))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            let order = self.get_order_model(order_id).await?;
            return Err(ServiceError::InvalidState(format!(
                "Order {} is not paid (payment status {:?})",
                order_id, order.payment_status
            )));
        }

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        for item in &items {
            InventoryService::release_on(&txn, item.product_id, item.quantity).await?;
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderRefunded(order_id))
            .await;
        for item in &items {
            self.event_sender
                .send_or_log(Event::StockReleased {
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .await;
        }

        info!(%order_id, refund_id, "order refunded");
        let order = self.get_order_model(order_id).await?;
        Ok(OrderView { order, items })
    }

    /// Cancels an unpaid order and releases its reservations.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;

        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .filter(
                order::Column::Status
                    .is_in([OrderStatus::Pending, OrderStatus::Processing]),
            )
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            let order = self.get_order_model(order_id).await?;
            return Err(ServiceError::InvalidState(format!(
                "Order {} cannot be cancelled from status {:?}",
                order_id, order.status
            )));
        }

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        for item in &items {
            InventoryService::release_on(&txn, item.product_id, item.quantity).await?;
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;

        let order = self.get_order_model(order_id).await?;
        Ok(OrderView { order, items })
    }
}

/// Order with its item snapshots.
#[derive(Debug, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}
