use crate::{
    entities::{product, Product},
    errors::ServiceError,
};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Explicit product listing filter.
///
/// Replaces a dynamically shaped query object with enumerated optional
/// predicates. Predicates are AND-combined; each applies only when present,
/// and `min_price`/`max_price` bound the range independently.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ProductFilter {
    /// Case-sensitive substring match on the product name.
    pub name: Option<String>,
    /// Exact category match.
    pub category: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

/// Read-only catalog surface. Stock mutation lives in the inventory ledger.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Lists active products matching the filter, name-ordered.
    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        filter: ProductFilter,
    ) -> Result<Vec<product::Model>, ServiceError> {
        let mut query = Product::find().filter(product::Column::IsActive.eq(true));

        if let Some(name) = &filter.name {
            query = query.filter(product::Column::Name.contains(name));
        }
        if let Some(category) = &filter.category {
            query = query.filter(product::Column::Category.eq(category.clone()));
        }
        if let Some(min) = filter.min_price {
            query = query.filter(product::Column::Price.gte(min));
        }
        if let Some(max) = filter.max_price {
            query = query.filter(product::Column::Price.lte(max));
        }

        Ok(query.order_by_asc(product::Column::Name).all(&*self.db).await?)
    }
}
