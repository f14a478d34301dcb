use super::{CreateIntentRequest, GatewayIntent, GatewayRefund, PaymentGateway};
use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{instrument, warn};

/// Stripe payment gateway client.
///
/// Speaks Stripe's form-encoded REST API with a bounded per-call timeout.
/// Intent creation is retried with exponential backoff because the per-order
/// idempotency key makes it safe; refunds are never blindly retried.
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
    max_retries: u32,
}

impl StripeGateway {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.gateway_timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            secret_key: config.stripe_secret_key.clone(),
            max_retries: config.gateway_max_retries,
        })
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, GatewayCallError> {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                GatewayCallError::Transient(e.to_string())
            } else {
                GatewayCallError::Permanent(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayCallError::Transient(format!(
                "gateway returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayCallError::Permanent(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayCallError::Permanent(format!("invalid gateway response: {}", e)))
    }
}

enum GatewayCallError {
    /// Network failure or 5xx; worth retrying for idempotent calls.
    Transient(String),
    /// 4xx or malformed response; retrying cannot help.
    Permanent(String),
}

impl From<GatewayCallError> for ServiceError {
    fn from(err: GatewayCallError) -> Self {
        match err {
            GatewayCallError::Transient(msg) | GatewayCallError::Permanent(msg) => {
                ServiceError::GatewayError(msg)
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, ServiceError> {
        let form = vec![
            ("amount".to_string(), request.amount_minor.to_string()),
            ("currency".to_string(), request.currency.clone()),
            (
                "metadata[order_id]".to_string(),
                request.order_id.to_string(),
            ),
        ];

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .post_form::<GatewayIntent>(
                    "/v1/payment_intents",
                    &form,
                    Some(&request.idempotency_key),
                )
                .await
            {
                Ok(intent) => return Ok(intent),
                Err(GatewayCallError::Transient(msg)) if attempt <= self.max_retries => {
                    let backoff = Duration::from_secs(2_u64.pow(attempt - 1));
                    warn!(attempt, error = %msg, "transient gateway failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        let form = vec![(
            "payment_intent".to_string(),
            payment_intent_id.to_string(),
        )];
        // Single attempt: the effect of a timed-out call is indeterminate at
        // the gateway. The idempotency key still dedupes any call that did
        // arrive, so a concurrent duplicate cannot refund twice.
        self.post_form::<GatewayRefund>("/v1/refunds", &form, Some(idempotency_key))
            .await
            .map_err(Into::into)
    }
}
