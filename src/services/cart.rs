use crate::{
    entities::{cart, cart_item, product, Cart, CartItem, Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Cart aggregator: all access to a user's single mutable cart.
///
/// Every mutation runs in a transaction that ends with a version-guarded cart
/// update, so concurrent sessions of one user cannot interleave a
/// read-modify-write; the loser fails with `Conflict`.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Adds a product to the user's cart, lazily creating the cart.
    ///
    /// If the product is already a line item the quantity accumulates and the
    /// stored price snapshot is overwritten with the product's current price.
    /// Last write wins for the whole line, not just the delta; callers re-adding
    /// after a catalog price change re-price the existing units too.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let product = find_active_product(&txn, product_id).await?;
        if product.stock < quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "Product {} has {} in stock, requested {}",
                product_id, product.stock, quantity
            )));
        }

        let cart = match find_cart(&txn, user_id).await? {
            Some(cart) => cart,
            None => create_cart(&txn, user_id).await?,
        };

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let new_quantity = item.quantity + quantity;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(new_quantity);
                item.price_snapshot = Set(product.price);
                item.updated_at = Set(Utc::now());
                item.update(&txn).await?;
            }
            None => {
                let item = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    price_snapshot: Set(product.price),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                };
                item.insert(&txn).await?;
            }
        }

        let view = commit_cart_mutation(txn, &cart).await?;

        self.event_sender
            .send_or_log(Event::CartUpdated {
                user_id,
                cart_id: cart.id,
            })
            .await;

        info!(%user_id, %product_id, quantity, "added item to cart");
        Ok(view)
    }

    /// Returns the user's cart populated with product details.
    ///
    /// A user without a cart gets an empty view; the cart row itself is only
    /// created on the first `add_item`.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = match find_cart(&*self.db, user_id).await? {
            Some(cart) => cart,
            None => return Ok(CartView::empty(user_id)),
        };
        load_cart_view(&*self.db, &cart).await
    }

    /// Replaces the quantity of an existing line item outright (not additive).
    ///
    /// The stock check is against the product's current stock, not against any
    /// reservation; over-promising across carts is caught at order commit.
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = find_cart(&txn, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for user {} not found", user_id)))?;

        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not in cart", product_id))
            })?;

        let product = find_active_product(&txn, product_id).await?;
        if product.stock < quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "Product {} has {} in stock, requested {}",
                product_id, product.stock, quantity
            )));
        }

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(Utc::now());
        item.update(&txn).await?;

        let view = commit_cart_mutation(txn, &cart).await?;

        self.event_sender
            .send_or_log(Event::CartUpdated {
                user_id,
                cart_id: cart.id,
            })
            .await;

        Ok(view)
    }

    /// Removes a line item. Removing a product that is not in the cart is a
    /// no-op; the unchanged cart is returned.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = find_cart(&txn, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for user {} not found", user_id)))?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?;

        let view = commit_cart_mutation(txn, &cart).await?;

        self.event_sender
            .send_or_log(Event::CartUpdated {
                user_id,
                cart_id: cart.id,
            })
            .await;

        Ok(view)
    }
}

async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Option<cart::Model>, ServiceError> {
    Ok(Cart::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?)
}

async fn create_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<cart::Model, ServiceError> {
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        total_amount: Set(Decimal::ZERO),
        version: Set(0),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    };
    Ok(cart.insert(conn).await?)
}

async fn find_active_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    let product = Product::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
    if !product.is_active {
        return Err(ServiceError::NotFound(format!(
            "Product {} not found",
            product_id
        )));
    }
    Ok(product)
}

/// Recomputes the cart total, applies the version-guarded cart update and
/// commits. A concurrent mutation since `cart` was read leaves zero rows
/// affected, rolling the transaction back with `Conflict`.
async fn commit_cart_mutation(
    txn: sea_orm::DatabaseTransaction,
    cart: &cart::Model,
) -> Result<CartView, ServiceError> {
    let items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .all(&txn)
        .await?;

    let total: Decimal = items
        .iter()
        .map(|item| item.price_snapshot * Decimal::from(item.quantity))
        .sum();

    let result = Cart::update_many()
        .col_expr(cart::Column::TotalAmount, Expr::value(total))
        .col_expr(cart::Column::Version, Expr::value(cart.version + 1))
        .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(cart::Column::Id.eq(cart.id))
        .filter(cart::Column::Version.eq(cart.version))
        .exec(&txn)
        .await?;

    if result.rows_affected == 0 {
        txn.rollback().await?;
        return Err(ServiceError::Conflict(format!(
            "Cart {} was modified concurrently",
            cart.id
        )));
    }

    let view = build_cart_view(&txn, cart, items, total).await?;
    txn.commit().await?;
    Ok(view)
}

async fn load_cart_view<C: ConnectionTrait>(
    conn: &C,
    cart: &cart::Model,
) -> Result<CartView, ServiceError> {
    let items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let total = cart.total_amount;
    build_cart_view(conn, cart, items, total).await
}

async fn build_cart_view<C: ConnectionTrait>(
    conn: &C,
    cart: &cart::Model,
    items: Vec<cart_item::Model>,
    total: Decimal,
) -> Result<CartView, ServiceError> {
    let mut views = Vec::with_capacity(items.len());
    for item in items {
        let product = Product::find_by_id(item.product_id).one(conn).await?;
        views.push(CartItemView {
            product_id: item.product_id,
            name: product.map(|p| p.name).unwrap_or_default(),
            quantity: item.quantity,
            price_snapshot: item.price_snapshot,
            line_total: item.price_snapshot * Decimal::from(item.quantity),
        });
    }

    Ok(CartView {
        id: Some(cart.id),
        user_id: cart.user_id,
        items: views,
        total_amount: total,
    })
}

/// Cart response populated with product details.
#[derive(Debug, Serialize)]
pub struct CartView {
    /// Absent until the first `add_item` creates the cart.
    pub id: Option<Uuid>,
    pub user_id: Uuid,
    pub items: Vec<CartItemView>,
    pub total_amount: Decimal,
}

impl CartView {
    fn empty(user_id: Uuid) -> Self {
        Self {
            id: None,
            user_id,
            items: Vec::new(),
            total_amount: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CartItemView {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub price_snapshot: Decimal,
    pub line_total: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectOptions, Database};

    async fn test_db() -> DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Database::connect(opt).await.unwrap();
        crate::db::provision_schema(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn committing_against_a_stale_cart_version_is_a_conflict() {
        let db = test_db().await;
        let stale = create_cart(&db, Uuid::new_v4()).await.unwrap();

        // Another session mutates the cart after our read.
        Cart::update_many()
            .col_expr(cart::Column::Version, Expr::value(stale.version + 1))
            .filter(cart::Column::Id.eq(stale.id))
            .exec(&db)
            .await
            .unwrap();

        let txn = db.begin().await.unwrap();
        let err = commit_cart_mutation(txn, &stale).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        // The losing commit left the winner's version in place.
        let cart = Cart::find_by_id(stale.id).one(&db).await.unwrap().unwrap();
        assert_eq!(cart.version, stale.version + 1);
    }

    #[tokio::test]
    async fn committing_with_the_current_version_bumps_it() {
        let db = test_db().await;
        let cart = create_cart(&db, Uuid::new_v4()).await.unwrap();

        let txn = db.begin().await.unwrap();
        commit_cart_mutation(txn, &cart).await.unwrap();

        let reloaded = Cart::find_by_id(cart.id).one(&db).await.unwrap().unwrap();
        assert_eq!(reloaded.version, cart.version + 1);
    }
}
