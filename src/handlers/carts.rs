use crate::{
    handlers::common::{success_response, validate_input, UserId},
    errors::ServiceError,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Routes for the cart surface.
pub fn cart_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/:product_id", patch(update_item))
        .route("/items/:product_id", delete(remove_item))
}

#[derive(Debug, Deserialize, Validate)]
struct AddItemRequest {
    product_id: Uuid,
    #[validate(range(min = 1))]
    quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateItemRequest {
    #[validate(range(min = 1))]
    quantity: i32,
}

async fn get_cart(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.get_cart(user_id).await?;
    Ok(success_response(cart))
}

async fn add_item(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state
        .services
        .cart
        .add_item(user_id, payload.product_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

async fn update_item(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state
        .services
        .cart
        .update_item(user_id, product_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

async fn remove_item(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.remove_item(user_id, product_id).await?;
    Ok(success_response(cart))
}
