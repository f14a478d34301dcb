mod common;

use common::TestApp;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use storefront_api::{
    entities::order::{OrderStatus, PaymentStatus},
    errors::ServiceError,
};
use uuid::Uuid;

#[tokio::test]
async fn order_creation_locks_prices_and_decrements_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Widget", dec!(10.00), 5).await;
    let user = Uuid::new_v4();

    app.state
        .services
        .cart
        .add_item(user, product, 2)
        .await
        .unwrap();

    let order = app.state.services.orders.create_order(user).await.unwrap();

    assert_eq!(order.order.total_amount, dec!(20.00));
    assert_eq!(order.order.status, OrderStatus::Pending);
    assert_eq!(order.order.payment_status, PaymentStatus::Unpaid);
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].quantity, 2);
    assert_eq!(order.items[0].unit_price, dec!(10.00));

    // Stock reserved and cart cleared.
    assert_eq!(app.product(product).await.stock, 3);
    let cart = app.state.services.cart.get_cart(user).await.unwrap();
    assert!(cart.items.is_empty());
    assert_eq!(cart.total_amount, Decimal::ZERO);
}

#[tokio::test]
async fn order_price_is_decoupled_from_later_catalog_changes() {
    let app = TestApp::new().await;
    let product = app.seed_product("Widget", dec!(10.00), 5).await;
    let user = Uuid::new_v4();

    app.state
        .services
        .cart
        .add_item(user, product, 1)
        .await
        .unwrap();
    let order = app.state.services.orders.create_order(user).await.unwrap();

    app.set_price(product, dec!(99.00)).await;

    let reloaded = app
        .state
        .services
        .orders
        .get_order(order.order.id)
        .await
        .unwrap();
    assert_eq!(reloaded.order.total_amount, dec!(10.00));
    assert_eq!(reloaded.items[0].unit_price, dec!(10.00));
}

#[tokio::test]
async fn empty_cart_cannot_become_an_order() {
    let app = TestApp::new().await;
    let err = app
        .state
        .services
        .orders
        .create_order(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));
}

#[tokio::test]
async fn multi_item_reservation_is_all_or_nothing() {
    let app = TestApp::new().await;
    let plenty = app.seed_product("Plenty", dec!(5.00), 50).await;
    let scarce = app.seed_product("Scarce", dec!(7.50), 1).await;
    let user = Uuid::new_v4();
    let cart_service = &app.state.services.cart;

    cart_service.add_item(user, plenty, 3).await.unwrap();
    // Stock validation at add time passes; a competing order then consumes
    // the scarce unit before this user commits.
    cart_service.add_item(user, scarce, 1).await.unwrap();
    app.state
        .services
        .inventory
        .reserve(scarce, 1)
        .await
        .unwrap();

    let err = app
        .state
        .services
        .orders
        .create_order(user)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientStock(_)));

    // The failed order leaked nothing: the plentiful product is untouched.
    assert_eq!(app.product(plenty).await.stock, 50);
    // And the cart survives for a retry.
    let cart = cart_service.get_cart(user).await.unwrap();
    assert_eq!(cart.items.len(), 2);
}

#[tokio::test]
async fn stock_never_goes_negative_under_concurrent_reservation() {
    let app = TestApp::new().await;
    let product = app.seed_product("Hot item", dec!(10.00), 5).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let inventory = app.state.services.inventory.clone();
        handles.push(tokio::spawn(
            async move { inventory.reserve(product, 1).await },
        ));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    // Exactly floor(stock / qty) reservations win.
    assert_eq!(succeeded, 5);
    assert_eq!(app.product(product).await.stock, 0);
}

#[tokio::test]
async fn concurrent_orders_for_the_last_unit_admit_one_winner() {
    let app = TestApp::new().await;
    let product = app.seed_product("Last one", dec!(25.00), 1).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    for user in [alice, bob] {
        app.state
            .services
            .cart
            .add_item(user, product, 1)
            .await
            .unwrap();
    }

    let orders_a = app.state.services.orders.clone();
    let orders_b = app.state.services.orders.clone();
    let (a, b) = tokio::join!(orders_a.create_order(alice), orders_b.create_order(bob));

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "exactly one order wins");
    assert_eq!(app.product(product).await.stock, 0);
}

#[tokio::test]
async fn release_restores_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Widget", dec!(10.00), 5).await;
    let inventory = &app.state.services.inventory;

    inventory.reserve(product, 4).await.unwrap();
    assert_eq!(app.product(product).await.stock, 1);

    inventory.release(product, 4).await.unwrap();
    assert_eq!(app.product(product).await.stock, 5);
}

#[tokio::test]
async fn cancelling_an_unpaid_order_releases_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Widget", dec!(10.00), 5).await;
    let user = Uuid::new_v4();

    app.state
        .services
        .cart
        .add_item(user, product, 2)
        .await
        .unwrap();
    let order = app.state.services.orders.create_order(user).await.unwrap();
    assert_eq!(app.product(product).await.stock, 3);

    let cancelled = app
        .state
        .services
        .orders
        .cancel_order(order.order.id)
        .await
        .unwrap();
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert_eq!(app.product(product).await.stock, 5);

    // Terminal: a second cancel is rejected.
    let err = app
        .state
        .services
        .orders
        .cancel_order(order.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));
}

#[tokio::test]
async fn orders_are_listed_newest_first() {
    let app = TestApp::new().await;
    let product = app.seed_product("Widget", dec!(10.00), 50).await;
    let user = Uuid::new_v4();

    for _ in 0..2 {
        app.state
            .services
            .cart
            .add_item(user, product, 1)
            .await
            .unwrap();
        app.state.services.orders.create_order(user).await.unwrap();
    }

    let orders = app.state.services.orders.list_orders(user).await.unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders[0].created_at >= orders[1].created_at);
}
