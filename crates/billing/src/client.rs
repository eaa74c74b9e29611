//! Payment processor client
//!
//! [`PaymentGateway`] is the single seam to the processor. [`HttpGateway`] talks to a
//! Square-style REST API with reqwest; [`GatewayClient`] wraps any gateway with bounded
//! retries for transient failures and turns raw results into billing outcomes.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::money::Money;

/// Processor connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub access_token: String,
    /// Key used to sign webhook notifications
    pub webhook_signature_key: String,
    /// Public URL the processor posts webhooks to; part of the signed payload
    pub webhook_notification_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let base_url = required_env("PAYMENTS_BASE_URL")?;
        let access_token = required_env("PAYMENTS_ACCESS_TOKEN")?;
        let webhook_signature_key = required_env("PAYMENTS_WEBHOOK_SIGNATURE_KEY")?;
        let webhook_notification_url = required_env("PAYMENTS_WEBHOOK_URL")?;

        let timeout_secs: u64 = std::env::var("PAYMENTS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let max_retries: usize = std::env::var("PAYMENTS_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            webhook_signature_key,
            webhook_notification_url,
            timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            },
        })
    }
}

fn required_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
}

/// Backoff for transient gateway failures. Declines and configuration errors never retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = u64::try_from(self.base_delay.as_millis() / 2)
            .unwrap_or(u64::MAX)
            .max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Deterministic key identifying one logical gateway operation.
///
/// Derived from the operation kind and the parts that make the operation unique, so a
/// retry of the same logical charge always carries the same key. Also sent as the
/// payment's `reference_id`, which lets webhooks find the owner of a charge whose
/// response was lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(kind: &str, parts: &[&dyn Display]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        for part in parts {
            hasher.update(b":");
            hasher.update(part.to_string().as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self(format!("{}_{}", kind, &digest[..32]))
    }

    /// Rehydrate a key that was persisted earlier
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processor payment states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Approved,
    Pending,
    Completed,
    Canceled,
    Failed,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(PaymentStatus::Approved),
            "PENDING" => Some(PaymentStatus::Pending),
            "COMPLETED" => Some(PaymentStatus::Completed),
            "CANCELED" => Some(PaymentStatus::Canceled),
            "FAILED" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PaymentStatus::Completed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PaymentStatus::Canceled | PaymentStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

/// Processor refund states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Completed,
    Rejected,
    Failed,
}

impl RefundStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RefundStatus::Pending),
            "COMPLETED" => Some(RefundStatus::Completed),
            "REJECTED" => Some(RefundStatus::Rejected),
            "FAILED" => Some(RefundStatus::Failed),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RefundStatus::Completed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RefundStatus::Rejected | RefundStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_ref: String,
    pub amount: Money,
    pub idempotency_key: IdempotencyKey,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub external_payment_id: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub external_payment_id: String,
    pub amount: Money,
    pub idempotency_key: IdempotencyKey,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub external_refund_id: String,
    pub status: RefundStatus,
}

/// Normalized processor failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("declined ({code:?})")]
    Declined { code: Option<String> },
    #[error("transient: {0}")]
    Transient(String),
    #[error("configuration: {0}")]
    Configuration(String),
}

impl From<GatewayError> for BillingError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Declined { code } => BillingError::GatewayDeclined { code },
            GatewayError::Transient(msg) => BillingError::GatewayTransient(msg),
            GatewayError::Configuration(msg) => BillingError::GatewayConfiguration(msg),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(
        &self,
        account_id: Uuid,
        idempotency_key: &IdempotencyKey,
    ) -> Result<String, GatewayError>;

    /// Exchange a one-time source token for a reusable card reference
    async fn save_payment_method(
        &self,
        customer_id: &str,
        source_token: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<String, GatewayError>;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, GatewayError>;
}

/// What a charge attempt means for the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Completed { payment_id: String },
    /// Accepted but not final, or outcome unknown after retries. Webhooks settle it.
    Pending { payment_id: Option<String> },
    Declined { code: Option<String> },
}

/// Gateway wrapper adding bounded retries and outcome mapping
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<dyn PaymentGateway>,
    retry: RetryPolicy,
}

impl GatewayClient {
    pub fn new(inner: Arc<dyn PaymentGateway>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }

    pub async fn create_customer(
        &self,
        account_id: Uuid,
        key: &IdempotencyKey,
    ) -> BillingResult<String> {
        let result = self
            .with_retry("create_customer", || self.inner.create_customer(account_id, key))
            .await;
        result.map_err(|e| self.surface("create_customer", e))
    }

    pub async fn save_payment_method(
        &self,
        customer_id: &str,
        source_token: &str,
        key: &IdempotencyKey,
    ) -> BillingResult<String> {
        let result = self
            .with_retry("save_payment_method", || {
                self.inner.save_payment_method(customer_id, source_token, key)
            })
            .await;
        result.map_err(|e| self.surface("save_payment_method", e))
    }

    /// Charge with retries. Only configuration errors come back as `Err`.
    pub async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeOutcome> {
        match self.with_retry("charge", || self.inner.charge(request)).await {
            Ok(receipt) if receipt.status.is_success() => Ok(ChargeOutcome::Completed {
                payment_id: receipt.external_payment_id,
            }),
            Ok(receipt) if receipt.status.is_failure() => {
                tracing::info!(
                    payment_id = %receipt.external_payment_id,
                    status = ?receipt.status,
                    "Charge finished in a failed state"
                );
                Ok(ChargeOutcome::Declined { code: None })
            }
            Ok(receipt) => Ok(ChargeOutcome::Pending {
                payment_id: Some(receipt.external_payment_id),
            }),
            Err(GatewayError::Declined { code }) => Ok(ChargeOutcome::Declined { code }),
            Err(GatewayError::Transient(message)) => {
                tracing::warn!(
                    idempotency_key = %request.idempotency_key,
                    error = %message,
                    "Charge outcome unknown after retries, awaiting webhook"
                );
                Ok(ChargeOutcome::Pending { payment_id: None })
            }
            Err(e @ GatewayError::Configuration(_)) => Err(self.surface("charge", e)),
        }
    }

    pub async fn refund(&self, request: &RefundRequest) -> BillingResult<RefundReceipt> {
        let result = self
            .with_retry("refund", || self.inner.refund(request))
            .await;
        result.map_err(|e| self.surface("refund", e))
    }

    async fn with_retry<T, A, F>(&self, operation: &'static str, mut action: A) -> Result<T, GatewayError>
    where
        A: FnMut() -> F,
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0usize;
        RetryIf::spawn(
            self.retry.delays(),
            || {
                attempt += 1;
                if attempt > 1 {
                    tracing::warn!(operation, attempt, "Retrying gateway call after transient error");
                }
                action()
            },
            |e: &GatewayError| matches!(e, GatewayError::Transient(_)),
        )
        .await
    }

    fn surface(&self, operation: &'static str, e: GatewayError) -> BillingError {
        if let GatewayError::Configuration(message) = &e {
            tracing::error!(alert = true, operation, error = %message, "Payment gateway configuration error");
        }
        e.into()
    }
}

/// reqwest implementation of [`PaymentGateway`]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Debug, Serialize)]
struct AmountMoney<'a> {
    amount: i64,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ProcessorError>,
}

#[derive(Debug, Deserialize)]
struct ProcessorError {
    category: Option<String>,
    code: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomerEnvelope {
    customer: IdOnly,
}

#[derive(Debug, Deserialize)]
struct CardEnvelope {
    card: IdOnly,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentEnvelope {
    payment: PaymentBody,
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundEnvelope {
    refund: RefundBody,
}

#[derive(Debug, Deserialize)]
struct RefundBody {
    id: String,
    status: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_response(status, &text));
        }

        // A success status with an unreadable body leaves the outcome unknown
        serde_json::from_str(&text).map_err(|e| {
            tracing::warn!(path, error = %e, "Unreadable processor response");
            GatewayError::Transient(format!("unreadable response from {}", path))
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_customer(
        &self,
        account_id: Uuid,
        idempotency_key: &IdempotencyKey,
    ) -> Result<String, GatewayError> {
        let body = serde_json::json!({
            "idempotency_key": idempotency_key.as_str(),
            "reference_id": account_id.to_string(),
        });
        let envelope: CustomerEnvelope = self.post("/v2/customers", body).await?;
        Ok(envelope.customer.id)
    }

    async fn save_payment_method(
        &self,
        customer_id: &str,
        source_token: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<String, GatewayError> {
        let body = serde_json::json!({
            "idempotency_key": idempotency_key.as_str(),
            "source_id": source_token,
            "card": { "customer_id": customer_id },
        });
        let envelope: CardEnvelope = self.post("/v2/cards", body).await?;
        Ok(envelope.card.id)
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let body = serde_json::json!({
            "idempotency_key": request.idempotency_key.as_str(),
            "source_id": request.payment_method_ref,
            "customer_id": request.customer_id,
            "amount_money": AmountMoney {
                amount: request.amount.minor_units,
                currency: request.amount.currency.as_str(),
            },
            "reference_id": request.idempotency_key.as_str(),
            "note": request.note,
            "autocomplete": true,
        });
        let envelope: PaymentEnvelope = self.post("/v2/payments", body).await?;
        let status = PaymentStatus::parse(&envelope.payment.status).ok_or_else(|| {
            GatewayError::Transient(format!("unknown payment status {}", envelope.payment.status))
        })?;
        Ok(ChargeReceipt {
            external_payment_id: envelope.payment.id,
            status,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, GatewayError> {
        let body = serde_json::json!({
            "idempotency_key": request.idempotency_key.as_str(),
            "payment_id": request.external_payment_id,
            "amount_money": AmountMoney {
                amount: request.amount.minor_units,
                currency: request.amount.currency.as_str(),
            },
            "reason": request.reason,
        });
        let envelope: RefundEnvelope = self.post("/v2/refunds", body).await?;
        let status = RefundStatus::parse(&envelope.refund.status).ok_or_else(|| {
            GatewayError::Transient(format!("unknown refund status {}", envelope.refund.status))
        })?;
        Ok(RefundReceipt {
            external_refund_id: envelope.refund.id,
            status,
        })
    }
}

fn classify_transport(e: reqwest::Error) -> GatewayError {
    if e.is_builder() {
        GatewayError::Configuration(e.to_string())
    } else {
        GatewayError::Transient(e.to_string())
    }
}

fn classify_response(status: StatusCode, body: &str) -> GatewayError {
    let first = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| env.errors.into_iter().next());
    let code = first.as_ref().and_then(|e| e.code.clone());
    let category = first.as_ref().and_then(|e| e.category.as_deref());

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return GatewayError::Transient(format!("processor returned {}", status));
    }
    if status == StatusCode::PAYMENT_REQUIRED || category == Some("PAYMENT_METHOD_ERROR") {
        return GatewayError::Declined { code };
    }

    let detail = first
        .as_ref()
        .and_then(|e| e.detail.clone())
        .unwrap_or_else(|| "no detail".to_string());
    GatewayError::Configuration(format!("processor returned {}: {}", status, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: String) -> GatewayConfig {
        GatewayConfig {
            base_url: url,
            access_token: "test-token".to_string(),
            webhook_signature_key: "sig".to_string(),
            webhook_notification_url: "https://example.test/payments/webhook".to_string(),
            timeout: Duration::from_secs(2),
            retry: RetryPolicy::immediate(2),
        }
    }

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            customer_id: "cust_1".to_string(),
            payment_method_ref: "ccof_1".to_string(),
            amount: Money::usd(1000),
            idempotency_key: IdempotencyKey::derive("renewal", &[&"sub_1", &1700000000i64, &0]),
            note: "renewal".to_string(),
        }
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let sub = Uuid::new_v4();
        let a = IdempotencyKey::derive("renewal", &[&sub, &1700000000i64, &0]);
        let b = IdempotencyKey::derive("renewal", &[&sub, &1700000000i64, &0]);
        let next_attempt = IdempotencyKey::derive("renewal", &[&sub, &1700000000i64, &1]);
        assert_eq!(a, b);
        assert_ne!(a, next_attempt);
        assert!(a.as_str().starts_with("renewal_"));
        assert!(a.as_str().len() <= 45);
    }

    #[test]
    fn test_classify_response() {
        let declined = classify_response(
            StatusCode::BAD_REQUEST,
            r#"{"errors":[{"category":"PAYMENT_METHOD_ERROR","code":"CARD_DECLINED","detail":"x"}]}"#,
        );
        assert_eq!(
            declined,
            GatewayError::Declined {
                code: Some("CARD_DECLINED".to_string())
            }
        );
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, ""),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::UNAUTHORIZED, r#"{"errors":[]}"#),
            GatewayError::Configuration(_)
        ));
    }

    #[tokio::test]
    async fn test_http_charge_completed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/payments")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_body(r#"{"payment":{"id":"pay_123","status":"COMPLETED"}}"#)
            .expect(1)
            .create_async()
            .await;

        let gateway = HttpGateway::new(&config(server.url())).unwrap();
        let receipt = gateway.charge(&charge_request()).await.unwrap();

        assert_eq!(receipt.external_payment_id, "pay_123");
        assert_eq!(receipt.status, PaymentStatus::Completed);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_left_pending() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/payments")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let cfg = config(server.url());
        let client = GatewayClient::new(Arc::new(HttpGateway::new(&cfg).unwrap()), cfg.retry);
        let outcome = client.charge(&charge_request()).await.unwrap();

        assert_eq!(outcome, ChargeOutcome::Pending { payment_id: None });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_declines_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/payments")
            .with_status(402)
            .with_body(r#"{"errors":[{"category":"PAYMENT_METHOD_ERROR","code":"INSUFFICIENT_FUNDS"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let cfg = config(server.url());
        let client = GatewayClient::new(Arc::new(HttpGateway::new(&cfg).unwrap()), cfg.retry);
        let outcome = client.charge(&charge_request()).await.unwrap();

        assert_eq!(
            outcome,
            ChargeOutcome::Declined {
                code: Some("INSUFFICIENT_FUNDS".to_string())
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_configuration_errors_surface() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/refunds")
            .with_status(401)
            .with_body(r#"{"errors":[{"category":"AUTHENTICATION_ERROR","code":"UNAUTHORIZED","detail":"bad token"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let cfg = config(server.url());
        let client = GatewayClient::new(Arc::new(HttpGateway::new(&cfg).unwrap()), cfg.retry);
        let err = client
            .refund(&RefundRequest {
                external_payment_id: "pay_1".to_string(),
                amount: Money::usd(500),
                idempotency_key: IdempotencyKey::derive("refund", &[&"p1"]),
                reason: "requested".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::GatewayConfiguration(_)));
        mock.assert_async().await;
    }
}
