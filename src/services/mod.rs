pub mod cart;
pub mod catalog;
pub mod inventory;
pub mod orders;
pub mod payments;

use crate::{config::AppConfig, events::EventSender, gateway::PaymentGateway};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// All application services, built once at startup and shared via `AppState`.
#[derive(Clone)]
pub struct AppServices {
    pub inventory: Arc<inventory::InventoryService>,
    pub cart: Arc<cart::CartService>,
    pub orders: Arc<orders::OrderService>,
    pub payments: Arc<payments::PaymentService>,
    pub catalog: Arc<catalog::CatalogService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        config: Arc<AppConfig>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let inventory = Arc::new(inventory::InventoryService::new(
            db.clone(),
            event_sender.clone(),
        ));
        let cart = Arc::new(cart::CartService::new(db.clone(), event_sender.clone()));
        let orders = Arc::new(orders::OrderService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let payments = Arc::new(payments::PaymentService::new(
            orders.clone(),
            gateway,
            config,
        ));
        let catalog = Arc::new(catalog::CatalogService::new(db));

        Self {
            inventory,
            cart,
            orders,
            payments,
            catalog,
        }
    }
}
