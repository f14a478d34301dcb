//! Storefront API Library
//!
//! Transactional core of an e-commerce order pipeline: carts, orders,
//! inventory reservation, payment lifecycle, and webhook reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod services;

use axum::{response::Json, routing::get, Router};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: services::AppServices,
}

/// Builds the full application router.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/cart", handlers::cart_routes())
        .nest("/orders", handlers::order_routes())
        .nest(
            "/payments",
            handlers::payment_routes().merge(handlers::webhook_routes()),
        )
        .nest("/products", handlers::product_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "success", "data": { "healthy": true } }))
}
