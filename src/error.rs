//! Error types of the quota and ledger core.

use thiserror::Error;

use crate::Points;
use crate::model::{CounterpartyId, UserId};
use crate::store::StoreError;

/// Top-level error returned by [`Engine::handle`](crate::Engine::handle).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("coupon: {0}")]
    Coupon(#[from] CouponError),

    #[error("{0}")]
    Throttle(#[from] ThrottleError),
}

impl EngineError {
    /// Stable machine-readable error code for the calling layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::Ledger(e) => e.code(),
            EngineError::Coupon(e) => e.code(),
            EngineError::Throttle(e) => e.code(),
        }
    }

    /// Seconds until a throttled request may be retried.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            EngineError::Throttle(e) => Some(e.retry_after_secs()),
            _ => None,
        }
    }
}

/// Error during a balance mutation or ledger query.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("insufficient balance for user {user}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        user: UserId,
        balance: Points,
        requested: Points,
    },

    #[error("store unavailable after {attempts} attempt(s): {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("ledger of user {user} sums to {derived} but stored balance is {stored}")]
    Diverged {
        user: UserId,
        stored: Points,
        derived: Points,
    },
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "ValidationError",
            LedgerError::InsufficientBalance { .. } => "InsufficientBalance",
            LedgerError::StoreUnavailable { .. } | LedgerError::Diverged { .. } => {
                "StoreUnavailable"
            }
        }
    }
}

/// Error during coupon validation or redemption.
#[derive(Debug, Error)]
pub enum CouponError {
    #[error("{0}")]
    Validation(String),

    #[error("coupon {0} not found")]
    NotFound(String),

    #[error("coupon {0} is inactive")]
    Inactive(String),

    #[error("coupon {0} is not valid yet")]
    NotYetValid(String),

    #[error("coupon {0} has expired")]
    Expired(String),

    #[error("coupon {code} is not available to user {user}")]
    Ineligible { code: String, user: UserId },

    #[error("coupon {0} has reached its usage limit")]
    Exhausted(String),

    #[error("coupon {code} already redeemed by user {user}")]
    AlreadyRedeemed { code: String, user: UserId },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl CouponError {
    pub fn code(&self) -> &'static str {
        match self {
            CouponError::Validation(_) => "ValidationError",
            CouponError::NotYetValid(_) | CouponError::Expired(_) => "CouponExpired",
            CouponError::NotFound(_)
            | CouponError::Inactive(_)
            | CouponError::Ineligible { .. }
            | CouponError::Exhausted(_) => "CouponIneligible",
            CouponError::AlreadyRedeemed { .. } => "AlreadyRedeemed",
            CouponError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }
}

/// Throttling rejections; both are recoverable after the stated delay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("rate limit exceeded for {endpoint}, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        endpoint: String,
        retry_after_secs: u64,
    },

    #[error("daily quota exceeded for counterparty {counterparty}, retry after {retry_after_secs}s")]
    DailyQuotaExceeded {
        counterparty: CounterpartyId,
        retry_after_secs: u64,
    },
}

impl ThrottleError {
    pub fn code(&self) -> &'static str {
        match self {
            ThrottleError::RateLimitExceeded { .. } => "RateLimitExceeded",
            ThrottleError::DailyQuotaExceeded { .. } => "DailyQuotaExceeded",
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            ThrottleError::RateLimitExceeded {
                retry_after_secs, ..
            }
            | ThrottleError::DailyQuotaExceeded {
                retry_after_secs, ..
            } => *retry_after_secs,
        }
    }
}
