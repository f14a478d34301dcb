pub mod carts;
pub mod common;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;
pub mod products;

pub use carts::cart_routes;
pub use orders::order_routes;
pub use payment_webhooks::webhook_routes;
pub use payments::payment_routes;
pub use products::product_routes;
