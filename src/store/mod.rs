//! Persistence seam for balances, transactions, coupons and redemptions.
//!
//! Every mutating call is one atomic unit: it re-validates its
//! preconditions against current state and either commits all of its
//! writes or none of them. Services never split a read-decide-write
//! sequence across calls without a compare-and-swap token.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Points;
use crate::ledger::AccountBalance;
use crate::model::{Coupon, CouponId, CouponRedemption, NewTransaction, Transaction, UserId};

mod memory;
pub use memory::MemoryStore;

/// Constraint names reported by [`StoreError::UniqueViolation`] and
/// [`StoreError::CheckViolation`].
pub mod constraint {
    pub const REDEMPTION_UNIQUE: &str = "coupon_redemptions_coupon_user_seq";
    pub const COUPON_CODE_UNIQUE: &str = "coupons_code";
    pub const BALANCE_NON_NEGATIVE: &str = "account_balances_non_negative";
    pub const COUPON_MISSING: &str = "coupons_exists";
    pub const COUPON_ACTIVE: &str = "coupons_active";
    pub const COUPON_VALIDITY: &str = "coupons_validity";
    pub const COUPON_MAX_USES: &str = "coupons_max_uses";
    pub const COUPON_MAX_USES_PER_USER: &str = "coupons_max_uses_per_user";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("concurrent modification of account {0}")]
    Conflict(UserId),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(&'static str),

    #[error("check constraint violated: {0}")]
    CheckViolation(&'static str),
}

impl StoreError {
    /// Optimistic-concurrency conflicts are the only retryable store error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything a coupon redemption writes, committed together.
#[derive(Debug, Clone)]
pub struct RedemptionUnit {
    pub coupon_id: CouponId,
    pub code: String,
    pub user: UserId,
    /// Per-user redemption ordinal; part of the uniqueness key.
    pub sequence: u32,
    pub points: Points,
    pub description: String,
    pub at: DateTime<Utc>,
}

/// Rows written by a committed [`RedemptionUnit`].
#[derive(Debug, Clone)]
pub struct RedemptionReceipt {
    pub redemption: CouponRedemption,
    pub coupon: Coupon,
    /// `None` when the coupon grants no points.
    pub transaction: Option<Transaction>,
}

/// Interface for the persisted state of the core.
///
/// Implementations:
/// - `MemoryStore`: in-process tables with per-key locking
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Current balance row, `None` before the first credit.
    async fn account(&self, user: UserId) -> Result<Option<AccountBalance>>;

    /// All balance rows.
    async fn accounts(&self) -> Result<Vec<AccountBalance>>;

    /// Apply `tx` to its account and append it to the log, provided the
    /// account is still at `expected_version` (0 for an absent account).
    ///
    /// Fails with `Conflict` on a version mismatch and with
    /// `CheckViolation(BALANCE_NON_NEGATIVE)` when the balance would go negative.
    async fn commit_transaction(
        &self,
        expected_version: u64,
        tx: NewTransaction,
    ) -> Result<(AccountBalance, Transaction)>;

    /// Transaction log of one user in commit order.
    async fn transactions(&self, user: UserId) -> Result<Vec<Transaction>>;

    /// Look up a coupon by normalized code.
    async fn coupon_by_code(&self, code: &str) -> Result<Option<Coupon>>;

    /// Create or edit a coupon. Edits keep the stored id and usage counter.
    async fn upsert_coupon(&self, coupon: Coupon) -> Result<Coupon>;

    /// Number of redemptions `user` has made of `coupon_id`.
    async fn redemption_count(&self, coupon_id: CouponId, user: UserId) -> Result<u32>;

    /// All redemptions of a coupon.
    async fn redemptions(&self, coupon_id: CouponId) -> Result<Vec<CouponRedemption>>;

    /// Insert the redemption row, bump the coupon's usage counter and credit
    /// the ledger as one unit. The coupon's activity, validity window and caps
    /// are re-checked inside the unit.
    async fn commit_redemption(&self, unit: RedemptionUnit) -> Result<RedemptionReceipt>;
}

/// Run a store call under a deadline, surfacing `Timeout` instead of hanging.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
