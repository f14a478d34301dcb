use crate::{
    handlers::common::success_response,
    errors::ServiceError,
    services::catalog::ProductFilter,
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

/// Read-only catalog routes.
pub fn product_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_products))
        .route("/:id", get(get_product))
}

async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProductFilter>,
) -> Result<impl IntoResponse, ServiceError> {
    let products = state.services.catalog.list_products(filter).await?;
    Ok(success_response(products))
}

async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.catalog.get_product(product_id).await?;
    Ok(success_response(product))
}
