use chrono::{DateTime, Utc};

use crate::Points;
use crate::model::UserId;

/// Stored balance of one account, the cached projection of its ledger.
/// `version` increments with every committed mutation and is the
/// compare-and-swap token for optimistic writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub user: UserId,
    pub balance: Points,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    pub fn new(user: UserId, at: DateTime<Utc>) -> Self {
        Self {
            user,
            balance: Points::ZERO,
            version: 0,
            updated_at: at,
        }
    }

    /// Balance after applying a signed `amount`, or `None` when it would go
    /// negative or overflow.
    pub fn projected(&self, amount: Points) -> Option<Points> {
        self.balance
            .checked_add(amount)
            .filter(|after| !after.is_negative())
    }

    /// Apply a signed `amount`, returning `(before, after)`. Leaves the
    /// account untouched when the result would be negative.
    pub fn apply(&mut self, amount: Points, at: DateTime<Utc>) -> Option<(Points, Points)> {
        let after = self.projected(amount)?;
        let before = self.balance;
        self.balance = after;
        self.version += 1;
        self.updated_at = at;
        Some((before, after))
    }
}
