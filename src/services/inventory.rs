use crate::{
    entities::{product, Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Inventory ledger: the only writer of `products.stock`.
///
/// Every debit and credit is a single conditional UPDATE at the storage layer,
/// so stock can never go negative under concurrent checkout attempts.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Reserves stock for a product, failing when fewer than `quantity` units
    /// remain.
    #[instrument(skip(self))]
    pub async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        Self::reserve_on(&*self.db, product_id, quantity).await?;
        self.event_sender
            .send_or_log(Event::StockReserved {
                product_id,
                quantity,
            })
            .await;
        Ok(())
    }

    /// Releases previously reserved stock back to the product.
    #[instrument(skip(self))]
    pub async fn release(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        Self::release_on(&*self.db, product_id, quantity).await?;
        self.event_sender
            .send_or_log(Event::StockReleased {
                product_id,
                quantity,
            })
            .await;
        Ok(())
    }

    /// Conditional stock debit: `stock = stock - quantity` guarded by
    /// `stock >= quantity`, decided entirely by the storage layer.
    ///
    /// Runs on any connection so order creation can reserve inside its own
    /// transaction and get rollback of all debits on failure.
    pub async fn reserve_on<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            // Zero rows means either an unknown product or a shortfall; a read
            // on the failure path disambiguates the error kind.
            let product = Product::find_by_id(product_id)
                .one(conn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", product_id))
                })?;
            return Err(ServiceError::InsufficientStock(format!(
                "Product {} has {} in stock, requested {}",
                product_id, product.stock, quantity
            )));
        }

        info!(%product_id, quantity, "stock reserved");
        Ok(())
    }

    /// Conditional stock credit, the inverse of [`Self::reserve_on`].
    pub async fn release_on<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }

        info!(%product_id, quantity, "stock released");
        Ok(())
    }

    /// Reserves stock for every `(product_id, quantity)` pair.
    ///
    /// Must be called inside a transaction: the first failing reservation
    /// propagates its error and the caller's rollback undoes the debits
    /// already taken, so multi-item orders reserve all or nothing.
    pub async fn reserve_all_on<C: ConnectionTrait>(
        conn: &C,
        items: &[(Uuid, i32)],
    ) -> Result<(), ServiceError> {
        for &(product_id, quantity) in items {
            Self::reserve_on(conn, product_id, quantity).await?;
        }
        Ok(())
    }

    /// Current stock level, for diagnostics and tests.
    pub async fn stock_level(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        let product = Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        Ok(product.stock)
    }
}
