//! Coupon redemption service.
//!
//! Validation runs outside the store as a fast path. The authoritative
//! checks happen again inside [`Store::commit_redemption`], where the
//! `(coupon, user, sequence)` uniqueness key decides which of several
//! concurrent attempts wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::Points;
use crate::error::CouponError;
use crate::model::{Coupon, CouponRedemption, DiscountType, Transaction, UserId};
use crate::store::{self, RedemptionUnit, Store, StoreError, constraint};

/// Result of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponOutcome {
    pub success: bool,
    pub code: String,
    pub points_granted: Points,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    /// The `coupon_grant` entry, for point coupons.
    pub transaction: Option<Transaction>,
}

pub struct CouponService<S> {
    store: Arc<S>,
    store_timeout: Duration,
}

impl<S: Store> CouponService<S> {
    pub fn new(store: Arc<S>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Create or edit a coupon on behalf of the administrative collaborator.
    pub async fn upsert(&self, mut coupon: Coupon) -> Result<Coupon, CouponError> {
        coupon.code = Coupon::normalize_code(&coupon.code);
        if coupon.code.is_empty() {
            return Err(CouponError::Validation("coupon code is empty".to_string()));
        }
        if coupon.valid_from > coupon.valid_until {
            return Err(CouponError::Validation(format!(
                "coupon {} ends before it starts",
                coupon.code
            )));
        }
        if coupon.discount_value <= 0 {
            return Err(CouponError::Validation(format!(
                "coupon {} needs a positive discount",
                coupon.code
            )));
        }
        if coupon.discount_type == DiscountType::Percentage && coupon.discount_value > 100 {
            return Err(CouponError::Validation(format!(
                "coupon {} discounts more than 100%",
                coupon.code
            )));
        }
        if coupon.max_uses_per_user == 0 {
            return Err(CouponError::Validation(format!(
                "coupon {} allows no uses per user",
                coupon.code
            )));
        }
        Ok(self.call(self.store.upsert_coupon(coupon)).await?)
    }

    /// Check that `user` may redeem `code` at `now`, returning the coupon.
    pub async fn validate(
        &self,
        code: &str,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<Coupon, CouponError> {
        let (coupon, _) = self.validate_with_count(code, user, now).await?;
        Ok(coupon)
    }

    /// Apply `code` for `user`: record the redemption, count the use and
    /// credit the points, all or nothing.
    pub async fn redeem(
        &self,
        code: &str,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<CouponOutcome, CouponError> {
        let (coupon, prior) = self.validate_with_count(code, user, now).await?;

        let unit = RedemptionUnit {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            user,
            sequence: prior,
            points: coupon.points_granted(),
            description: format!("coupon {}", coupon.code),
            at: now,
        };

        let receipt = self
            .call(self.store.commit_redemption(unit))
            .await
            .map_err(|e| Self::rejection(e, &coupon.code, user))?;

        info!(
            user,
            code = %coupon.code,
            points = %receipt.redemption.points_granted,
            uses = receipt.coupon.current_uses,
            "coupon redeemed"
        );

        Ok(CouponOutcome {
            success: true,
            code: coupon.code,
            points_granted: receipt.redemption.points_granted,
            discount_type: coupon.discount_type,
            discount_value: coupon.discount_value,
            transaction: receipt.transaction,
        })
    }

    /// Redemption rows of a coupon.
    pub async fn redemptions(&self, code: &str) -> Result<Vec<CouponRedemption>, CouponError> {
        let coupon = self.find(code).await?;
        Ok(self.call(self.store.redemptions(coupon.id)).await?)
    }

    pub async fn get(&self, code: &str) -> Result<Coupon, CouponError> {
        self.find(code).await
    }
}

impl<S: Store> CouponService<S> {
    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = store::Result<T>>,
    ) -> store::Result<T> {
        store::bounded(self.store_timeout, fut).await
    }

    async fn find(&self, code: &str) -> Result<Coupon, CouponError> {
        let code = Coupon::normalize_code(code);
        if code.is_empty() {
            return Err(CouponError::Validation("coupon code is empty".to_string()));
        }
        self.call(self.store.coupon_by_code(&code))
            .await?
            .ok_or(CouponError::NotFound(code))
    }

    /// Runs the checks in order: exists, active, validity window, audience,
    /// global cap, per-user cap. Also returns the user's prior redemptions.
    async fn validate_with_count(
        &self,
        code: &str,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Coupon, u32), CouponError> {
        let coupon = self.find(code).await?;
        let code = coupon.code.clone();

        if !coupon.is_active {
            return Err(CouponError::Inactive(code));
        }
        if now < coupon.valid_from {
            return Err(CouponError::NotYetValid(code));
        }
        if now > coupon.valid_until {
            return Err(CouponError::Expired(code));
        }
        if !coupon.admits(user) {
            return Err(CouponError::Ineligible { code, user });
        }
        if coupon.is_exhausted() {
            return Err(CouponError::Exhausted(code));
        }

        let prior = self
            .call(self.store.redemption_count(coupon.id, user))
            .await?;
        if prior >= coupon.max_uses_per_user {
            info!(user, code = %code, prior, "coupon redemption refused");
            return Err(CouponError::AlreadyRedeemed { code, user });
        }
        Ok((coupon, prior))
    }

    fn rejection(err: StoreError, code: &str, user: UserId) -> CouponError {
        let code = code.to_string();
        match err {
            StoreError::UniqueViolation(constraint::REDEMPTION_UNIQUE)
            | StoreError::CheckViolation(constraint::COUPON_MAX_USES_PER_USER) => {
                info!(user, code = %code, "concurrent duplicate redemption rejected");
                CouponError::AlreadyRedeemed { code, user }
            }
            StoreError::CheckViolation(constraint::COUPON_MISSING) => CouponError::NotFound(code),
            StoreError::CheckViolation(constraint::COUPON_ACTIVE) => CouponError::Inactive(code),
            StoreError::CheckViolation(constraint::COUPON_VALIDITY) => CouponError::Expired(code),
            StoreError::CheckViolation(constraint::COUPON_MAX_USES) => {
                CouponError::Exhausted(code)
            }
            other => CouponError::StoreUnavailable(other),
        }
    }
}
