// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor context in several variants
#![allow(clippy::too_many_arguments)] // Ledger rows have many columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patronage Billing Module
//!
//! Subscription billing and wallet ledger engine for creator subscriptions and paid posts.
//!
//! ## Features
//!
//! - **Subscriptions**: Subscribe, renew, cancel and resume monthly creator subscriptions
//! - **Purchases**: One-time purchases of paid posts, with admin refunds
//! - **Wallet Ledger**: Paired debit/credit rows per charge, platform fee withheld on the credit
//! - **Renewals**: Batch renewal of due subscriptions with bounded dunning
//! - **Webhooks**: Signed processor events reconcile pending charges and refunds
//! - **Invariants**: Runnable zero-sum and state consistency checks over the ledger
//! - **Notifications**: Presence-aware fan-out to subscribers and creators

pub mod catalog;
pub mod client;
pub mod clock;
pub mod config;
pub mod customer;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod locks;
pub mod money;
pub mod notify;
pub mod purchases;
pub mod refund;
pub mod renewal;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Catalog
pub use catalog::{ContentCatalog, PgCatalog, PricedPost};

// Client
pub use client::{
    ChargeOutcome, GatewayClient, GatewayConfig, GatewayError, HttpGateway, IdempotencyKey,
    PaymentGateway, RetryPolicy,
};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::BillingConfig;

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{Ledger, TransactionStatus, TransactionType, WalletSummary, WalletTransaction};

// Money
pub use money::{split, Currency, FeePercent, FeeSplit, Money};

// Notifications
pub use notify::{NotificationKind, Notifier, RealtimeNotifier, TracingNotifier};

// Purchases
pub use purchases::{Purchase, PurchaseService, PurchaseStatus};

// Refund
pub use refund::{RefundResult, RefundService};

// Renewal
pub use renewal::{RenewalResult, RenewalRunSummary, RenewalScheduler};

// Store
pub use store::{BillingStore, MemoryStore, PgStore, StoreTx};

// Subscriptions
pub use subscriptions::{RenewalOutcome, Subscription, SubscriptionService, SubscriptionStatus};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookOutcome, WebhookProcessor, WebhookSigning, SIGNATURE_HEADER};

use std::sync::Arc;

use locks::KeyedLocks;
use sqlx::PgPool;
use uuid::Uuid;

/// Collaborators shared by every billing service
pub struct BillingContext {
    pub store: Arc<dyn BillingStore>,
    pub gateway: GatewayClient,
    pub catalog: Arc<dyn ContentCatalog>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub locks: KeyedLocks,
    pub config: BillingConfig,
    pub ledger: Ledger,
}

impl BillingContext {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: GatewayClient,
        catalog: Arc<dyn ContentCatalog>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: BillingConfig,
    ) -> Self {
        let ledger = Ledger::new(store.clone(), config.currency);
        Self {
            store,
            gateway,
            catalog,
            notifier,
            clock,
            locks: KeyedLocks::new(),
            config,
            ledger,
        }
    }

    /// Fire-and-forget notification; delivery failures are logged by the notifier
    pub async fn notify(&self, account_id: Uuid, kind: NotificationKind, payload: serde_json::Value) {
        self.notifier.notify(account_id, kind, payload).await;
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub context: Arc<BillingContext>,
    pub customers: CustomerService,
    pub subscriptions: SubscriptionService,
    pub purchases: PurchaseService,
    pub refunds: RefundService,
    pub renewals: RenewalScheduler,
    pub webhooks: WebhookProcessor,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool, notifier: Arc<dyn Notifier>) -> BillingResult<Self> {
        let gateway = GatewayConfig::from_env()?;
        let config = BillingConfig::from_env()?;
        Self::new(gateway, config, pool, notifier)
    }

    /// Create a new billing service with explicit config, backed by Postgres and the HTTP gateway
    pub fn new(
        gateway: GatewayConfig,
        config: BillingConfig,
        pool: PgPool,
        notifier: Arc<dyn Notifier>,
    ) -> BillingResult<Self> {
        let http = HttpGateway::new(&gateway)?;
        let context = BillingContext::new(
            Arc::new(PgStore::new(pool.clone())),
            GatewayClient::new(Arc::new(http), gateway.retry),
            Arc::new(PgCatalog::new(pool, config.currency)),
            notifier,
            Arc::new(SystemClock),
            config,
        );
        Ok(Self::from_context(
            Arc::new(context),
            WebhookSigning::from_gateway_config(&gateway),
        ))
    }

    /// Assemble the services around an existing context
    pub fn from_context(context: Arc<BillingContext>, signing: WebhookSigning) -> Self {
        Self {
            customers: CustomerService::new(context.clone()),
            subscriptions: SubscriptionService::new(context.clone()),
            purchases: PurchaseService::new(context.clone()),
            refunds: RefundService::new(context.clone()),
            renewals: RenewalScheduler::new(context.clone()),
            webhooks: WebhookProcessor::new(context.clone(), signing),
            invariants: InvariantChecker::new(context.store.clone(), context.clock.clone()),
            context,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.context.ledger
    }
}
