//! Core domain types for the quota and ledger core.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Points;

/// User identifier, issued by the authentication collaborator.
pub type UserId = u64;

/// Identifier of the other party of a metered action (the daily quota dimension).
pub type CounterpartyId = u64;

/// Ledger transaction identifier.
pub type TxId = u64;

/// Coupon identifier, assigned by the store.
pub type CouponId = u64;

/// Reason code attached to every ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Consumption,
    Refund,
    AdminAdjustment,
    CouponGrant,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Consumption => "consumption",
            TransactionKind::Refund => "refund",
            TransactionKind::AdminAdjustment => "admin_adjustment",
            TransactionKind::CouponGrant => "coupon_grant",
        }
    }

    /// Whether this kind may increase a balance.
    pub fn allows_credit(self) -> bool {
        !matches!(self, TransactionKind::Consumption)
    }

    /// Whether this kind may decrease a balance.
    pub fn allows_debit(self) -> bool {
        matches!(
            self,
            TransactionKind::Consumption | TransactionKind::AdminAdjustment
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed, immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: TxId,
    pub user: UserId,
    pub kind: TransactionKind,
    /// Signed: positive for credits, negative for debits.
    pub amount: Points,
    pub balance_before: Points,
    pub balance_after: Points,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A ledger entry not yet committed. The store assigns id, balances and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub user: UserId,
    pub kind: TransactionKind,
    pub amount: Points,
    pub description: String,
}

/// How a coupon's `discount_value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `discount_value` points are credited to the ledger.
    Points,
    /// `discount_value` percent off at checkout; no points are granted.
    Percentage,
}

/// Who may redeem a coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    #[default]
    All,
    Specific,
}

/// A promotional coupon, as written by the administrative collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    #[serde(default)]
    pub id: CouponId,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Global cap; `None` means unlimited.
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default = "default_max_uses_per_user")]
    pub max_uses_per_user: u32,
    #[serde(default)]
    pub target_audience: Audience,
    #[serde(default)]
    pub specific_user_ids: HashSet<UserId>,
    #[serde(default)]
    pub current_uses: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_max_uses_per_user() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

impl Coupon {
    /// Canonical form of a coupon code: trimmed, upper case.
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_ascii_uppercase()
    }

    /// Points credited by one redemption.
    pub fn points_granted(&self) -> Points {
        match self.discount_type {
            DiscountType::Points => Points::new(self.discount_value),
            DiscountType::Percentage => Points::ZERO,
        }
    }

    pub fn admits(&self, user: UserId) -> bool {
        match self.target_audience {
            Audience::All => true,
            Audience::Specific => self.specific_user_ids.contains(&user),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.current_uses >= max)
    }
}

/// One applied redemption. Unique on `(coupon_id, user, sequence)`; with the
/// default per-user cap of 1 the sequence is always 0 and the pair is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CouponRedemption {
    pub coupon_id: CouponId,
    pub user: UserId,
    pub sequence: u32,
    pub points_granted: Points,
    pub redeemed_at: DateTime<Utc>,
}

/// Requests accepted by the engine from the request-handling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Credit points bought through the (external) checkout flow.
    Purchase { user: UserId, amount: Points },
    /// Spend points on a metered action, optionally against a counterparty quota.
    Consume {
        user: UserId,
        amount: Points,
        counterparty: Option<CounterpartyId>,
    },
    /// Return previously consumed points.
    Refund { user: UserId, amount: Points },
    /// Administrative correction; the sign gives the direction.
    Adjust { user: UserId, delta: Points },
    /// Redeem a coupon code.
    Redeem { user: UserId, code: String },
}

impl Request {
    pub fn user(&self) -> UserId {
        match self {
            Request::Purchase { user, .. }
            | Request::Consume { user, .. }
            | Request::Refund { user, .. }
            | Request::Adjust { user, .. }
            | Request::Redeem { user, .. } => *user,
        }
    }

    /// Endpoint identifier used for rate limiting.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Request::Purchase { .. } => "purchase",
            Request::Consume { .. } => "consume",
            Request::Refund { .. } => "refund",
            Request::Adjust { .. } => "adjust",
            Request::Redeem { .. } => "redeem",
        }
    }
}

/// Best-effort client identification for throttling. Spoofable; never an
/// authentication boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFingerprint {
    /// Network origin, e.g. the forwarded client address.
    pub origin: Option<String>,
    /// Client signature, e.g. a user agent or device hash.
    pub signature: Option<String>,
}

impl ClientFingerprint {
    pub fn new(origin: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            signature: Some(signature.into()),
        }
    }

    pub fn client_id(&self) -> String {
        let clean = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        match (clean(&self.origin), clean(&self.signature)) {
            (Some(origin), Some(signature)) => format!("{origin}|{signature}"),
            (Some(origin), None) => origin,
            (None, Some(signature)) => format!("sig:{signature}"),
            (None, None) => "anonymous".to_string(),
        }
    }
}
