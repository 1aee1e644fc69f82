//! Ledger service.
//!
//! Owns per-user point balances and the append-only transaction log. Every
//! balance change goes through [`Ledger::commit`]: read the account, check
//! the result stays non-negative, then commit against the version that was
//! read. A commit that lost a race is retried with jittered backoff up to
//! `max_retries` times.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::Points;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::model::{NewTransaction, Transaction, TransactionKind, UserId};
use crate::store::{self, Store, StoreError, constraint};

mod state;
pub use state::AccountBalance;

pub struct Ledger<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

/// Public API
impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Increase the balance of `user` by `amount` and log it.
    pub async fn credit(
        &self,
        user: UserId,
        amount: Points,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Result<Transaction, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        if !kind.allows_credit() {
            return Err(LedgerError::Validation(format!("{kind} cannot credit")));
        }
        self.commit(NewTransaction {
            user,
            kind,
            amount,
            description: description.into(),
        })
        .await
    }

    /// Decrease the balance of `user` by `amount` and log it. Fails with
    /// `InsufficientBalance`, leaving no trace, when the balance is too low.
    pub async fn debit(
        &self,
        user: UserId,
        amount: Points,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Result<Transaction, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "debit amount must be positive, got {amount}"
            )));
        }
        if !kind.allows_debit() {
            return Err(LedgerError::Validation(format!("{kind} cannot debit")));
        }
        self.commit(NewTransaction {
            user,
            kind,
            amount: -amount,
            description: description.into(),
        })
        .await
    }

    /// Administrative adjustment; the sign of `delta` gives the direction.
    pub async fn adjust(
        &self,
        user: UserId,
        delta: Points,
        description: impl Into<String>,
    ) -> Result<Transaction, LedgerError> {
        let kind = TransactionKind::AdminAdjustment;
        if delta.is_negative() {
            self.debit(user, delta.abs(), kind, description).await
        } else {
            self.credit(user, delta, kind, description).await
        }
    }

    /// Current balance; zero for users that were never credited.
    pub async fn balance(&self, user: UserId) -> Result<Points, LedgerError> {
        let account = self
            .call(self.store.account(user))
            .await
            .map_err(|source| LedgerError::StoreUnavailable {
                attempts: 1,
                source,
            })?;
        Ok(account.map(|a| a.balance).unwrap_or(Points::ZERO))
    }

    /// Transaction log of `user` in commit order.
    pub async fn history(&self, user: UserId) -> Result<Vec<Transaction>, LedgerError> {
        self.call(self.store.transactions(user))
            .await
            .map_err(|source| LedgerError::StoreUnavailable {
                attempts: 1,
                source,
            })
    }

    /// All stored balances.
    pub async fn accounts(&self) -> Result<Vec<AccountBalance>, LedgerError> {
        self.call(self.store.accounts())
            .await
            .map_err(|source| LedgerError::StoreUnavailable {
                attempts: 1,
                source,
            })
    }

    /// Recompute the balance from the transaction log and compare it with
    /// the stored projection.
    pub async fn verify(&self, user: UserId) -> Result<Points, LedgerError> {
        let stored = self.balance(user).await?;
        let derived: Points = self.history(user).await?.iter().map(|t| t.amount).sum();
        if derived != stored {
            warn!(user, %stored, %derived, "ledger diverged from balance");
            return Err(LedgerError::Diverged {
                user,
                stored,
                derived,
            });
        }
        Ok(stored)
    }
}

/// Private API
impl<S: Store> Ledger<S> {
    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = store::Result<T>>,
    ) -> store::Result<T> {
        store::bounded(self.config.store_timeout(), fut).await
    }

    async fn commit(&self, tx: NewTransaction) -> Result<Transaction, LedgerError> {
        let user = tx.user;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let unavailable = |source: StoreError| LedgerError::StoreUnavailable { attempts, source };

            let account = self.call(self.store.account(user)).await.map_err(unavailable)?;
            let (version, balance) = account
                .map(|a| (a.version, a.balance))
                .unwrap_or((0, Points::ZERO));

            let insufficient = || LedgerError::InsufficientBalance {
                user,
                balance,
                requested: tx.amount.abs(),
            };
            match balance.checked_add(tx.amount) {
                Some(after) if !after.is_negative() => {}
                Some(_) => {
                    info!(user, %balance, amount = %tx.amount, "debit rejected");
                    return Err(insufficient());
                }
                None => {
                    return Err(LedgerError::Validation(format!(
                        "amount {} overflows balance {balance}",
                        tx.amount
                    )));
                }
            }

            match self
                .call(self.store.commit_transaction(version, tx.clone()))
                .await
            {
                Ok((_, written)) => {
                    info!(
                        user,
                        tx = written.id,
                        kind = %written.kind,
                        amount = %written.amount,
                        balance = %written.balance_after,
                        "ledger entry committed"
                    );
                    return Ok(written);
                }
                Err(StoreError::CheckViolation(constraint::BALANCE_NON_NEGATIVE)) => {
                    return Err(insufficient());
                }
                Err(e) if e.is_conflict() && attempts <= self.config.max_retries => {
                    warn!(user, attempts, "balance commit conflicted, retrying");
                    tokio::time::sleep(self.backoff(attempts)).await;
                }
                Err(e) => return Err(unavailable(e)),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms.max(1);
        let cap = self.config.retry_max_delay_ms.max(base);
        let delay = base.saturating_mul(2u64.saturating_pow(attempt - 1)).min(cap);
        let jittered = rand::rng().random_range(delay / 2..=delay);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ledger() -> (Arc<MemoryStore>, Ledger<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), LedgerConfig::default());
        (store, ledger)
    }

    fn points(v: i64) -> Points {
        Points::new(v)
    }

    // Credit

    #[tokio::test]
    async fn credit_creates_account_and_logs_transaction() {
        let (_, ledger) = ledger();
        let tx = ledger
            .credit(1, points(480), TransactionKind::Purchase, "starter pack")
            .await
            .unwrap();

        assert_eq!(tx.kind, TransactionKind::Purchase);
        assert_eq!(tx.amount, points(480));
        assert_eq!(tx.balance_before, Points::ZERO);
        assert_eq!(tx.balance_after, points(480));
        assert_eq!(tx.description, "starter pack");
        assert_eq!(ledger.balance(1).await.unwrap(), points(480));
    }

    #[tokio::test]
    async fn credit_rejects_non_positive_amount() {
        let (_, ledger) = ledger();
        for amount in [0, -5] {
            let result = ledger
                .credit(1, points(amount), TransactionKind::Purchase, "")
                .await;
            assert!(matches!(result, Err(LedgerError::Validation(_))));
        }
        assert!(ledger.history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credit_rejects_debit_only_kind() {
        let (_, ledger) = ledger();
        let result = ledger
            .credit(1, points(5), TransactionKind::Consumption, "")
            .await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    // Debit

    #[tokio::test]
    async fn debit_decreases_balance() {
        let (_, ledger) = ledger();
        ledger
            .credit(1, points(480), TransactionKind::Purchase, "")
            .await
            .unwrap();
        let tx = ledger
            .debit(1, points(80), TransactionKind::Consumption, "message")
            .await
            .unwrap();

        assert_eq!(tx.amount, points(-80));
        assert_eq!(tx.balance_before, points(480));
        assert_eq!(tx.balance_after, points(400));
    }

    #[tokio::test]
    async fn debit_exact_balance_succeeds() {
        let (_, ledger) = ledger();
        ledger
            .credit(1, points(100), TransactionKind::Purchase, "")
            .await
            .unwrap();
        ledger
            .debit(1, points(100), TransactionKind::Consumption, "")
            .await
            .unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), Points::ZERO);
    }

    #[tokio::test]
    async fn debit_insufficient_balance_leaves_state_untouched() {
        let (_, ledger) = ledger();
        ledger
            .credit(1, points(480), TransactionKind::Purchase, "")
            .await
            .unwrap();

        let result = ledger
            .debit(1, points(500), TransactionKind::Consumption, "")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance { user: 1, balance, requested })
                if balance == points(480) && requested == points(500)
        ));
        assert_eq!(ledger.balance(1).await.unwrap(), points(480));
        assert_eq!(ledger.history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debit_unknown_user_is_insufficient() {
        let (_, ledger) = ledger();
        let result = ledger
            .debit(7, points(1), TransactionKind::Consumption, "")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance { user: 7, .. })
        ));
    }

    // Adjust

    #[tokio::test]
    async fn adjust_moves_in_both_directions() {
        let (_, ledger) = ledger();
        ledger.adjust(1, points(300), "goodwill").await.unwrap();
        let tx = ledger.adjust(1, points(-120), "correction").await.unwrap();

        assert_eq!(tx.kind, TransactionKind::AdminAdjustment);
        assert_eq!(tx.balance_after, points(180));
        assert!(matches!(
            ledger.adjust(1, Points::ZERO, "noop").await,
            Err(LedgerError::Validation(_))
        ));
    }

    // Verify

    #[tokio::test]
    async fn verify_matches_sum_of_log() {
        let (_, ledger) = ledger();
        ledger
            .credit(1, points(500), TransactionKind::Purchase, "")
            .await
            .unwrap();
        ledger
            .debit(1, points(120), TransactionKind::Consumption, "")
            .await
            .unwrap();
        ledger
            .credit(1, points(20), TransactionKind::Refund, "")
            .await
            .unwrap();

        assert_eq!(ledger.verify(1).await.unwrap(), points(400));
        assert_eq!(ledger.verify(2).await.unwrap(), Points::ZERO);
    }

    // Store faults

    #[tokio::test]
    async fn conflicts_are_retried() {
        let (store, ledger) = ledger();
        store.inject_conflicts(3);
        ledger
            .credit(1, points(10), TransactionKind::Purchase, "")
            .await
            .unwrap();
        assert_eq!(store.pending_conflicts(), 0);
        assert_eq!(ledger.balance(1).await.unwrap(), points(10));
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_as_unavailable() {
        let (store, ledger) = ledger();
        store.inject_conflicts(100);

        let result = ledger
            .credit(1, points(10), TransactionKind::Purchase, "")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::StoreUnavailable { attempts: 6, source: StoreError::Conflict(1) })
        ));
        // one initial attempt plus five retries
        assert_eq!(store.pending_conflicts(), 94);
        assert!(ledger.history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outage_is_not_retried() {
        let (store, ledger) = ledger();
        store.set_unavailable(true);

        let result = ledger
            .credit(1, points(10), TransactionKind::Purchase, "")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::StoreUnavailable {
                attempts: 1,
                source: StoreError::Unavailable(_)
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let (store, ledger) = ledger();
        store.set_latency(Duration::from_secs(30));

        let result = ledger
            .credit(1, points(10), TransactionKind::Purchase, "")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::StoreUnavailable {
                source: StoreError::Timeout(_),
                ..
            })
        ));
    }
}
