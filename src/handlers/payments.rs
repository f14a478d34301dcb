use crate::{
    handlers::common::success_response,
    errors::ServiceError,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Routes for the payment surface (webhook is routed separately on the raw
/// body).
pub fn payment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/intents", post(create_intent))
        .route("/:order_id/refund", post(refund))
}

#[derive(Debug, Deserialize)]
struct CreateIntentRequest {
    order_id: Uuid,
}

async fn create_intent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let intent = state
        .services
        .payments
        .create_payment_intent(payload.order_id)
        .await?;
    Ok(success_response(intent))
}

async fn refund(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let refund = state.services.payments.refund_payment(order_id).await?;
    Ok(success_response(refund))
}
