//! Request processing engine.
//!
//! Composes the four components in the order the request-handling layer
//! needs them: the rate limiter first (cheap, fails fast), then the daily
//! quota for counterparty actions, then the ledger or the coupon service.
//! Also supports an async stream of requests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::Points;
use crate::config::{Config, ConfigError};
use crate::coupon::{CouponOutcome, CouponService};
use crate::error::{CouponError, EngineError};
use crate::ledger::{AccountBalance, Ledger};
use crate::model::{ClientFingerprint, Coupon, Request, Transaction, TransactionKind, UserId};
use crate::quota::{QuotaDecision, QuotaTracker};
use crate::rate_limit::RateLimiter;
use crate::store::{MemoryStore, Store};

/// What a successful request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A ledger entry; `quota` is set for consumptions against a counterparty.
    Ledger {
        transaction: Transaction,
        quota: Option<QuotaDecision>,
    },
    Coupon(CouponOutcome),
}

impl Outcome {
    /// Balance after the request, when it touched the ledger.
    pub fn balance_after(&self) -> Option<Points> {
        match self {
            Outcome::Ledger { transaction, .. } => Some(transaction.balance_after),
            Outcome::Coupon(outcome) => outcome.transaction.as_ref().map(|t| t.balance_after),
        }
    }
}

/// The quota and ledger control core.
///
/// Throttle state lives in process memory and is owned by the engine: it is
/// created with it and dropped by [`Engine::shutdown`].
pub struct Engine<S = MemoryStore> {
    ledger: Ledger<S>,
    coupons: CouponService<S>,
    rate_limiter: RateLimiter,
    quota: QuotaTracker,
}

/// Public API
impl<S: Store> Engine<S> {
    pub fn new(config: &Config, store: Arc<S>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ledger: Ledger::new(store.clone(), config.ledger.clone()),
            coupons: CouponService::new(store, config.ledger.store_timeout()),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            quota: QuotaTracker::new(&config.quota)?,
        })
    }

    /// Write coupons into the store, returning how many were accepted.
    /// Invalid coupons are logged and skipped.
    pub async fn seed_coupons(
        &self,
        coupons: impl IntoIterator<Item = Coupon>,
    ) -> Result<usize, CouponError> {
        let mut seeded = 0;
        for coupon in coupons {
            match self.coupons.upsert(coupon).await {
                Ok(stored) => {
                    info!(code = %stored.code, id = stored.id, "coupon seeded");
                    seeded += 1;
                }
                Err(e @ CouponError::StoreUnavailable(_)) => return Err(e),
                Err(e) => warn!(reason = %e, "coupon skipped"),
            }
        }
        Ok(seeded)
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn coupons(&self) -> &CouponService<S> {
        &self.coupons
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Handle one request from `client` at `now`.
    pub async fn handle(
        &self,
        request: Request,
        client: &ClientFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        Self::validate(&request)?;
        self.rate_limiter
            .hit(&client.client_id(), request.endpoint())?;

        match request {
            Request::Purchase { user, amount } => {
                let transaction = self
                    .ledger
                    .credit(user, amount, TransactionKind::Purchase, "points purchase")
                    .await?;
                Ok(Outcome::Ledger {
                    transaction,
                    quota: None,
                })
            }
            Request::Consume {
                user,
                amount,
                counterparty,
            } => {
                let Some(counterparty) = counterparty else {
                    let transaction = self
                        .ledger
                        .debit(user, amount, TransactionKind::Consumption, "consumption")
                        .await?;
                    return Ok(Outcome::Ledger {
                        transaction,
                        quota: None,
                    });
                };

                let quota = self.quota.try_record(user, counterparty, now)?;
                let description = format!("consumption with {counterparty}");
                match self
                    .ledger
                    .debit(user, amount, TransactionKind::Consumption, description)
                    .await
                {
                    Ok(transaction) => Ok(Outcome::Ledger {
                        transaction,
                        quota: Some(quota),
                    }),
                    Err(e) => {
                        self.quota.release(user, counterparty, now);
                        Err(e.into())
                    }
                }
            }
            Request::Refund { user, amount } => {
                let transaction = self
                    .ledger
                    .credit(user, amount, TransactionKind::Refund, "refund")
                    .await?;
                Ok(Outcome::Ledger {
                    transaction,
                    quota: None,
                })
            }
            Request::Adjust { user, delta } => {
                let transaction = self
                    .ledger
                    .adjust(user, delta, "administrative adjustment")
                    .await?;
                Ok(Outcome::Ledger {
                    transaction,
                    quota: None,
                })
            }
            Request::Redeem { user, code } => {
                let outcome = self.coupons.redeem(&code, user, now).await?;
                Ok(Outcome::Coupon(outcome))
            }
        }
    }

    /// Run the engine over a stream of requests. Failures are logged and
    /// do not stop the stream.
    pub async fn run(
        &self,
        mut stream: impl Stream<Item = (Request, ClientFingerprint)> + Unpin,
    ) {
        while let Some((request, client)) = stream.next().await {
            let endpoint = request.endpoint();
            let user = request.user();
            let result = self.handle(request, &client, Utc::now()).await;
            Self::log_result(endpoint, user, &result);
        }
    }

    /// Snapshot of all stored balances, ordered by user.
    pub async fn balances(&self) -> Result<Vec<AccountBalance>, EngineError> {
        let mut accounts = self.ledger.accounts().await?;
        accounts.sort_by_key(|a| a.user);
        Ok(accounts)
    }

    /// Release in-memory throttle state.
    pub fn shutdown(&self) {
        self.rate_limiter.clear();
        self.quota.clear();
        info!("engine throttle state released");
    }
}

/// Private API
impl<S: Store> Engine<S> {
    fn validate(request: &Request) -> Result<(), EngineError> {
        match request {
            Request::Purchase { amount, .. }
            | Request::Consume { amount, .. }
            | Request::Refund { amount, .. }
                if !amount.is_positive() =>
            {
                Err(EngineError::Validation(format!(
                    "{} amount must be positive, got {amount}",
                    request.endpoint()
                )))
            }
            Request::Adjust { delta, .. } if *delta == Points::ZERO => Err(
                EngineError::Validation("adjustment must be non-zero".to_string()),
            ),
            Request::Redeem { code, .. } if code.trim().is_empty() => Err(
                EngineError::Validation("coupon code is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Small helper to log `handle` results
    fn log_result(endpoint: &str, user: UserId, result: &Result<Outcome, EngineError>) {
        match result {
            Ok(outcome) => match outcome.balance_after() {
                Some(balance) => info!(user, %balance, "{endpoint} applied"),
                None => info!(user, "{endpoint} applied"),
            },
            Err(e) => match e.retry_after_secs() {
                Some(retry_after) => info!(
                    user,
                    code = e.code(),
                    retry_after,
                    reason = %e,
                    "{endpoint} throttled"
                ),
                None => info!(user, code = e.code(), reason = %e, "{endpoint} skipped"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitRule;
    use crate::error::{LedgerError, ThrottleError};
    use crate::model::{Audience, DiscountType};
    use chrono::TimeZone;
    use std::collections::{HashMap, HashSet};

    // test utils

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.rate_limit.prune_probability = 0.0;
        config.quota.daily_limit = 2;
        config
    }

    fn engine(config: &Config) -> Engine {
        Engine::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    fn client() -> ClientFingerprint {
        ClientFingerprint::new("10.0.0.1", "test-agent")
    }

    fn purchase(user: UserId, amount: i64) -> Request {
        Request::Purchase {
            user,
            amount: Points::new(amount),
        }
    }

    fn consume(user: UserId, amount: i64, counterparty: Option<u64>) -> Request {
        Request::Consume {
            user,
            amount: Points::new(amount),
            counterparty,
        }
    }

    fn welcome() -> Coupon {
        Coupon {
            id: 0,
            code: "WELCOME500".into(),
            discount_type: DiscountType::Points,
            discount_value: 500,
            valid_from: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            valid_until: Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap(),
            max_uses: Some(100),
            max_uses_per_user: 1,
            target_audience: Audience::All,
            specific_user_ids: HashSet::new(),
            current_uses: 0,
            is_active: true,
        }
    }

    // Ledger requests

    #[tokio::test]
    async fn purchase_then_consume() {
        let engine = engine(&config());
        engine.handle(purchase(1, 480), &client(), now()).await.unwrap();
        let outcome = engine
            .handle(consume(1, 80, None), &client(), now())
            .await
            .unwrap();

        assert_eq!(outcome.balance_after(), Some(Points::new(400)));
        assert_eq!(engine.ledger().balance(1).await.unwrap(), Points::new(400));
    }

    #[tokio::test]
    async fn overdraft_is_rejected_and_balance_kept() {
        let engine = engine(&config());
        engine.handle(purchase(1, 480), &client(), now()).await.unwrap();

        let err = engine
            .handle(consume(1, 500, None), &client(), now())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InsufficientBalance");
        assert_eq!(engine.ledger().balance(1).await.unwrap(), Points::new(480));
    }

    #[tokio::test]
    async fn invalid_amounts_are_validation_errors() {
        let engine = engine(&config());
        for request in [
            purchase(1, 0),
            consume(1, -5, None),
            Request::Adjust {
                user: 1,
                delta: Points::ZERO,
            },
            Request::Redeem {
                user: 1,
                code: " ".into(),
            },
        ] {
            let err = engine.handle(request, &client(), now()).await.unwrap_err();
            assert_eq!(err.code(), "ValidationError");
        }
        // validation runs before the rate limiter counts anything
        assert!(engine.rate_limiter().is_empty());
    }

    #[tokio::test]
    async fn refund_and_adjust() {
        let engine = engine(&config());
        engine.handle(purchase(1, 100), &client(), now()).await.unwrap();
        engine
            .handle(
                Request::Refund {
                    user: 1,
                    amount: Points::new(20),
                },
                &client(),
                now(),
            )
            .await
            .unwrap();
        let outcome = engine
            .handle(
                Request::Adjust {
                    user: 1,
                    delta: Points::new(-50),
                },
                &client(),
                now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.balance_after(), Some(Points::new(70)));
        let kinds: Vec<_> = engine
            .ledger()
            .history(1)
            .await
            .unwrap()
            .iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TransactionKind::Purchase,
                TransactionKind::Refund,
                TransactionKind::AdminAdjustment
            ]
        );
    }

    // Quota

    #[tokio::test]
    async fn counterparty_quota_is_enforced() {
        let engine = engine(&config());
        engine.handle(purchase(1, 1_000), &client(), now()).await.unwrap();

        for expected_remaining in [1, 0] {
            let outcome = engine
                .handle(consume(1, 10, Some(42)), &client(), now())
                .await
                .unwrap();
            let Outcome::Ledger {
                quota: Some(quota), ..
            } = outcome
            else {
                panic!("expected quota decision");
            };
            assert_eq!(quota.remaining, expected_remaining);
        }

        let err = engine
            .handle(consume(1, 10, Some(42)), &client(), now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Throttle(ThrottleError::DailyQuotaExceeded {
                counterparty: 42,
                retry_after_secs: 43_200
            })
        ));
        assert_eq!(engine.ledger().balance(1).await.unwrap(), Points::new(980));

        // other counterparty and next day are unaffected
        engine
            .handle(consume(1, 10, Some(43)), &client(), now())
            .await
            .unwrap();
        let tomorrow = now() + chrono::Duration::days(1);
        engine
            .handle(consume(1, 10, Some(42)), &client(), tomorrow)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_debit_does_not_consume_quota() {
        let engine = engine(&config());
        let err = engine
            .handle(consume(1, 10, Some(42)), &client(), now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(engine.quota().check(1, 42, now()).current, 0);
    }

    // Rate limit

    #[tokio::test(start_paused = true)]
    async fn rate_limit_runs_first() {
        let mut config = config();
        config.rate_limit.endpoints = HashMap::from([(
            "purchase".to_string(),
            RateLimitRule {
                limit: 2,
                window_ms: 60_000,
            },
        )]);
        let engine = engine(&config);

        engine.handle(purchase(1, 10), &client(), now()).await.unwrap();
        engine.handle(purchase(1, 10), &client(), now()).await.unwrap();
        let err = engine
            .handle(purchase(1, 10), &client(), now())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RateLimitExceeded");
        assert_eq!(err.retry_after_secs(), Some(60));
        assert_eq!(engine.ledger().balance(1).await.unwrap(), Points::new(20));

        // another client is not affected
        let other = ClientFingerprint::new("10.0.0.2", "test-agent");
        engine.handle(purchase(1, 10), &other, now()).await.unwrap();
    }

    // Coupons

    #[tokio::test]
    async fn coupon_scenario() {
        let engine = engine(&config());
        assert_eq!(engine.seed_coupons([welcome()]).await.unwrap(), 1);

        let redeem = || Request::Redeem {
            user: 1,
            code: "WELCOME500".into(),
        };
        let outcome = engine.handle(redeem(), &client(), now()).await.unwrap();
        assert_eq!(outcome.balance_after(), Some(Points::new(500)));

        let err = engine.handle(redeem(), &client(), now()).await.unwrap_err();
        assert_eq!(err.code(), "AlreadyRedeemed");
        assert_eq!(
            engine.coupons().get("WELCOME500").await.unwrap().current_uses,
            1
        );
        assert_eq!(engine.ledger().balance(1).await.unwrap(), Points::new(500));
    }

    #[tokio::test]
    async fn seeding_skips_invalid_coupons() {
        let engine = engine(&config());
        let mut broken = welcome();
        broken.code = "BROKEN".into();
        broken.discount_value = 0;
        assert_eq!(engine.seed_coupons([welcome(), broken]).await.unwrap(), 1);
    }

    //  Async run()

    #[tokio::test]
    async fn run_skips_failed_requests_and_continues() {
        let engine = engine(&config());
        let requests = vec![
            (purchase(1, 100), client()),
            (consume(1, 200, None), client()), // insufficient balance
            (purchase(1, 50), client()),
            (purchase(2, 70), client()),
        ];

        engine.run(tokio_stream::iter(requests)).await;

        let balances = engine.balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].balance, Points::new(150));
        assert_eq!(balances[1].balance, Points::new(70));
    }

    #[tokio::test]
    async fn shutdown_releases_throttle_state() {
        let engine = engine(&config());
        engine.handle(purchase(1, 100), &client(), now()).await.unwrap();
        engine
            .handle(consume(1, 10, Some(5)), &client(), now())
            .await
            .unwrap();
        assert!(!engine.rate_limiter().is_empty());
        assert!(!engine.quota().is_empty());

        engine.shutdown();
        assert!(engine.rate_limiter().is_empty());
        assert!(engine.quota().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = config();
        config.quota.daily_limit = 0;
        assert!(Engine::new(&config, Arc::new(MemoryStore::new())).is_err());
    }
}
