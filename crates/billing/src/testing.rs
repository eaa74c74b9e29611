//! In-memory collaborators for tests
//!
//! Available to this crate's tests and, through the `testing` feature, to other crates.
//! [`TestHarness`] wires a [`BillingContext`] from a [`MemoryStore`], a scripted
//! [`FakeGateway`], a [`MemoryCatalog`], a [`RecordingNotifier`] and a [`ManualClock`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::macros::datetime;
use uuid::Uuid;

use crate::catalog::{ContentCatalog, PricedPost};
use crate::client::{
    ChargeReceipt, ChargeRequest, GatewayClient, GatewayError, IdempotencyKey, PaymentGateway,
    PaymentStatus, RefundReceipt, RefundRequest, RefundStatus, RetryPolicy,
};
use crate::clock::ManualClock;
use crate::config::BillingConfig;
use crate::customer::CustomerService;
use crate::error::BillingResult;
use crate::invariants::InvariantChecker;
use crate::ledger::Ledger;
use crate::money::Money;
use crate::notify::{NotificationKind, Notifier};
use crate::purchases::PurchaseService;
use crate::refund::RefundService;
use crate::renewal::RenewalScheduler;
use crate::subscriptions::SubscriptionService;
use crate::webhooks::{WebhookProcessor, WebhookSigning};
use crate::BillingContext;

pub use crate::store::{LockedRows, MemoryStore};

pub const TEST_WEBHOOK_KEY: &str = "whsec_test";
pub const TEST_WEBHOOK_URL: &str = "https://billing.test/payments/webhook";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct GatewayState {
    charge_script: VecDeque<Result<ChargeReceipt, GatewayError>>,
    refund_script: VecDeque<Result<RefundReceipt, GatewayError>>,
    charges_by_key: HashMap<String, Result<ChargeReceipt, GatewayError>>,
    refunds_by_key: HashMap<String, Result<RefundReceipt, GatewayError>>,
    charge_keys: Vec<String>,
    refund_count: usize,
    customers_created: usize,
}

/// Scripted processor.
///
/// Unscripted calls succeed. A response given for an idempotency key is replayed for
/// every later call with that key, like the real processor does; transient failures
/// are not remembered. [`FakeGateway::settle_charge`] moves a remembered payment on, so
/// a resubmitted key can see the payment complete or fail later.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response of the next charge with a fresh key
    pub fn push_charge(&self, response: Result<ChargeReceipt, GatewayError>) {
        lock(&self.state).charge_script.push_back(response);
    }

    pub fn push_refund(&self, response: Result<RefundReceipt, GatewayError>) {
        lock(&self.state).refund_script.push_back(response);
    }

    /// Report `status` for every later charge with `key`, keeping the payment id the
    /// key was first answered with
    pub fn settle_charge(&self, key: &str, status: PaymentStatus) {
        let mut state = lock(&self.state);
        let external_payment_id = match state.charges_by_key.get(key) {
            Some(Ok(receipt)) => receipt.external_payment_id.clone(),
            _ => Self::payment_id_for(key),
        };
        state.charges_by_key.insert(
            key.to_string(),
            Ok(ChargeReceipt {
                external_payment_id,
                status,
            }),
        );
    }

    /// Payment id an unscripted charge with `key` gets
    pub fn payment_id_for(key: &str) -> String {
        format!("pay_{}", key)
    }

    pub fn refund_id_for(key: &str) -> String {
        format!("rf_{}", key)
    }

    /// Calls to `charge`, retries included
    pub fn charge_count(&self) -> usize {
        lock(&self.state).charge_keys.len()
    }

    pub fn charge_keys(&self) -> Vec<String> {
        lock(&self.state).charge_keys.clone()
    }

    pub fn refund_count(&self) -> usize {
        lock(&self.state).refund_count
    }

    pub fn customers_created(&self) -> usize {
        lock(&self.state).customers_created
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(
        &self,
        account_id: Uuid,
        _idempotency_key: &IdempotencyKey,
    ) -> Result<String, GatewayError> {
        lock(&self.state).customers_created += 1;
        Ok(format!("cust_{}", account_id.simple()))
    }

    async fn save_payment_method(
        &self,
        _customer_id: &str,
        source_token: &str,
        _idempotency_key: &IdempotencyKey,
    ) -> Result<String, GatewayError> {
        Ok(format!("ccof_{}", source_token))
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let key = request.idempotency_key.as_str().to_string();
        let mut state = lock(&self.state);
        state.charge_keys.push(key.clone());

        if let Some(previous) = state.charges_by_key.get(&key) {
            return previous.clone();
        }
        let response = state.charge_script.pop_front().unwrap_or_else(|| {
            Ok(ChargeReceipt {
                external_payment_id: Self::payment_id_for(&key),
                status: PaymentStatus::Completed,
            })
        });
        if !matches!(response, Err(GatewayError::Transient(_))) {
            state.charges_by_key.insert(key, response.clone());
        }
        response
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, GatewayError> {
        let key = request.idempotency_key.as_str().to_string();
        let mut state = lock(&self.state);
        state.refund_count += 1;

        if let Some(previous) = state.refunds_by_key.get(&key) {
            return previous.clone();
        }
        let response = state.refund_script.pop_front().unwrap_or_else(|| {
            Ok(RefundReceipt {
                external_refund_id: Self::refund_id_for(&key),
                status: RefundStatus::Completed,
            })
        });
        if !matches!(response, Err(GatewayError::Transient(_))) {
            state.refunds_by_key.insert(key, response.clone());
        }
        response
    }
}

/// Tier and post prices held in memory
#[derive(Default)]
pub struct MemoryCatalog {
    tiers: Mutex<HashMap<Uuid, Money>>,
    posts: Mutex<HashMap<Uuid, PricedPost>>,
}

impl MemoryCatalog {
    pub fn set_tier(&self, creator_id: Uuid, price: Money) {
        lock(&self.tiers).insert(creator_id, price);
    }

    pub fn add_post(&self, creator_id: Uuid, price: Money) -> Uuid {
        let post_id = Uuid::new_v4();
        lock(&self.posts).insert(
            post_id,
            PricedPost {
                post_id,
                creator_id,
                price,
            },
        );
        post_id
    }

    pub fn remove_post(&self, post_id: Uuid) {
        lock(&self.posts).remove(&post_id);
    }
}

#[async_trait]
impl ContentCatalog for MemoryCatalog {
    async fn creator_tier_price(&self, creator_id: Uuid) -> BillingResult<Option<Money>> {
        Ok(lock(&self.tiers).get(&creator_id).copied())
    }

    async fn post_price(&self, post_id: Uuid) -> BillingResult<Option<PricedPost>> {
        Ok(lock(&self.posts).get(&post_id).copied())
    }
}

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub account_id: Uuid,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotification> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, account_id: Uuid) -> Vec<NotificationKind> {
        lock(&self.sent)
            .iter()
            .filter(|n| n.account_id == account_id)
            .map(|n| n.kind)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, account_id: Uuid, kind: NotificationKind, payload: serde_json::Value) {
        lock(&self.sent).push(SentNotification {
            account_id,
            kind,
            payload,
        });
    }
}

/// Fully wired in-memory engine
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub catalog: Arc<MemoryCatalog>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<BillingContext>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::default())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let catalog = Arc::new(MemoryCatalog::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-05 09:00 UTC)));

        let ctx = Arc::new(BillingContext::new(
            store.clone(),
            GatewayClient::new(gateway.clone(), RetryPolicy::immediate(2)),
            catalog.clone(),
            notifier.clone(),
            clock.clone(),
            config,
        ));

        Self {
            store,
            gateway,
            catalog,
            notifier,
            clock,
            ctx,
        }
    }

    /// New creator whose tier costs `price_minor`
    pub fn creator_with_price(&self, price_minor: i64) -> Uuid {
        let creator_id = Uuid::new_v4();
        self.catalog
            .set_tier(creator_id, Money::new(price_minor, self.ctx.config.currency));
        creator_id
    }

    pub fn post_with_price(&self, creator_id: Uuid, price_minor: i64) -> Uuid {
        self.catalog
            .add_post(creator_id, Money::new(price_minor, self.ctx.config.currency))
    }

    pub fn customers(&self) -> CustomerService {
        CustomerService::new(self.ctx.clone())
    }

    pub fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(self.ctx.clone())
    }

    pub fn purchases(&self) -> PurchaseService {
        PurchaseService::new(self.ctx.clone())
    }

    pub fn refunds(&self) -> RefundService {
        RefundService::new(self.ctx.clone())
    }

    pub fn renewals(&self) -> RenewalScheduler {
        RenewalScheduler::new(self.ctx.clone())
    }

    pub fn ledger(&self) -> Ledger {
        self.ctx.ledger.clone()
    }

    pub fn signing(&self) -> WebhookSigning {
        WebhookSigning::new(TEST_WEBHOOK_KEY, TEST_WEBHOOK_URL)
    }

    pub fn webhooks(&self) -> WebhookProcessor {
        WebhookProcessor::new(self.ctx.clone(), self.signing())
    }

    pub fn invariants(&self) -> InvariantChecker {
        InvariantChecker::new(self.ctx.store.clone(), self.ctx.clock.clone())
    }

    /// Panics with the violations if any ledger invariant is broken
    pub async fn assert_invariants(&self) {
        let summary = match self.invariants().run_all_checks().await {
            Ok(summary) => summary,
            Err(e) => panic!("invariant checks failed to run: {}", e),
        };
        assert!(
            summary.healthy,
            "ledger invariants violated: {:#?}",
            summary.violations
        );
    }

    /// Processor-shaped payment event body
    pub fn payment_event(
        event_id: &str,
        payment_id: &str,
        reference_id: Option<&str>,
        status: &str,
    ) -> Vec<u8> {
        serde_json::json!({
            "event_id": event_id,
            "type": "payment.updated",
            "data": {"object": {"payment": {
                "id": payment_id,
                "status": status,
                "reference_id": reference_id,
            }}},
        })
        .to_string()
        .into_bytes()
    }

    pub fn refund_event(event_id: &str, refund_id: &str, payment_id: &str, status: &str) -> Vec<u8> {
        serde_json::json!({
            "event_id": event_id,
            "type": "refund.updated",
            "data": {"object": {"refund": {
                "id": refund_id,
                "payment_id": payment_id,
                "status": status,
            }}},
        })
        .to_string()
        .into_bytes()
    }

    /// Signature header value for `body`
    pub fn sign(&self, body: &[u8]) -> String {
        match self.signing().sign(body) {
            Ok(signature) => signature,
            Err(e) => panic!("signing test webhook: {}", e),
        }
    }
}
