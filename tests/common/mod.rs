use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, EntityTrait, Set};
use storefront_api::{
    config::AppConfig,
    db,
    entities::product,
    errors::ServiceError,
    events::{self, EventSender},
    gateway::{CreateIntentRequest, GatewayIntent, GatewayRefund, PaymentGateway},
    services::AppServices,
    AppState,
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Recording payment gateway double.
///
/// Counts calls, hands out deterministic intent/refund ids, and can be
/// switched into a failure mode.
#[derive(Default)]
pub struct MockGateway {
    pub intent_calls: AtomicU32,
    pub refund_calls: AtomicU32,
    pub requests: Mutex<Vec<CreateIntentRequest>>,
    // (idempotency key, refund) pairs; repeated keys replay the stored refund
    // like the real gateway does.
    pub refunds: Mutex<Vec<(String, GatewayRefund)>>,
    pub fail: AtomicU32,
}

impl MockGateway {
    pub fn fail_next_calls(&self, n: u32) {
        self.fail.store(n, Ordering::SeqCst);
    }

    pub fn last_request(&self) -> Option<CreateIntentRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Refunds actually created, after idempotency-key deduplication.
    pub fn distinct_refunds(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }

    fn check_failure(&self) -> Result<(), ServiceError> {
        let remaining = self.fail.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::GatewayError("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, ServiceError> {
        self.check_failure()?;
        let n = self.intent_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);
        Ok(GatewayIntent {
            id: format!("pi_test_{}", n),
            client_secret: format!("pi_test_{}_secret", n),
        })
    }

    async fn refund(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        self.check_failure()?;
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        let _ = payment_intent_id;

        let mut refunds = self.refunds.lock().unwrap();
        if let Some((_, refund)) = refunds.iter().find(|(key, _)| key == idempotency_key) {
            return Ok(refund.clone());
        }
        let refund = GatewayRefund {
            id: format!("re_test_{}", refunds.len() + 1),
            status: "succeeded".to_string(),
        };
        refunds.push((idempotency_key.to_string(), refund.clone()));
        Ok(refund)
    }
}

/// Application harness backed by an in-memory SQLite database.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub gateway: Arc<MockGateway>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
            "sk_test_key".to_string(),
            WEBHOOK_SECRET.to_string(),
        );
        cfg.gateway_max_retries = 0;

        // A single pooled connection keeps every session on the same
        // in-memory database.
        let mut opt = ConnectOptions::new(cfg.database_url.clone());
        opt.max_connections(1).min_connections(1).sqlx_logging(false);
        let pool = Database::connect(opt)
            .await
            .expect("failed to open test database");
        db::provision_schema(&pool)
            .await
            .expect("failed to provision schema");
        let pool = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(MockGateway::default());
        let services = AppServices::new(
            pool.clone(),
            event_sender.clone(),
            Arc::new(cfg.clone()),
            gateway.clone(),
        );

        let state = Arc::new(AppState {
            db: pool,
            config: cfg,
            event_sender,
            services,
        });
        let router = storefront_api::api_router(state.clone());

        Self {
            state,
            router,
            gateway,
            _event_task: event_task,
        }
    }

    /// Inserts an active product and returns its id.
    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        self.seed_product_full(name, None, price, stock).await
    }

    pub async fn seed_product_full(
        &self,
        name: &str,
        category: Option<&str>,
        price: Decimal,
        stock: i32,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let model = product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            description: Set(None),
            category: Set(category.map(str::to_string)),
            price: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };
        model
            .insert(&*self.state.db)
            .await
            .expect("failed to seed product");
        id
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query failed")
            .expect("product not found")
    }

    /// Updates a product's catalog price directly, simulating an admin edit.
    pub async fn set_price(&self, id: Uuid, price: Decimal) {
        let model = self.product(id).await;
        let mut active: product::ActiveModel = model.into();
        active.price = Set(price);
        active.updated_at = Set(Utc::now());
        active
            .update(&*self.state.db)
            .await
            .expect("failed to update price");
    }
}
