//! In-process store.
//!
//! Each table is a `DashMap`; an atomic unit holds the entry guards of every
//! row it touches until all writes are done. Units that span tables always
//! lock in the order coupons, redemptions, accounts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::warn;

use super::{RedemptionReceipt, RedemptionUnit, Result, Store, StoreError, constraint};
use crate::Points;
use crate::ledger::AccountBalance;
use crate::model::{
    Coupon, CouponId, CouponRedemption, NewTransaction, Transaction, TransactionKind, TxId, UserId,
};

/// An account row together with its transaction log, so that both change
/// under the same entry lock.
#[derive(Debug)]
struct AccountRow {
    balance: AccountBalance,
    log: Vec<Transaction>,
}

type RedemptionKey = (CouponId, UserId, u32);

/// Failure injection used to exercise retry and timeout paths.
#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    conflicts: AtomicU32,
    latency_ms: AtomicU64,
}

#[derive(Debug)]
pub struct MemoryStore {
    accounts: DashMap<UserId, AccountRow>,
    coupons: DashMap<String, Coupon>,
    redemptions: DashMap<RedemptionKey, CouponRedemption>,
    next_tx_id: AtomicU64,
    next_coupon_id: AtomicU64,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            coupons: DashMap::new(),
            redemptions: DashMap::new(),
            next_tx_id: AtomicU64::new(1),
            next_coupon_id: AtomicU64::new(1),
            faults: Faults::default(),
        }
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Release);
    }

    /// Fail the next `n` balance commits with `Conflict`.
    pub fn inject_conflicts(&self, n: u32) {
        self.faults.conflicts.store(n, Ordering::Release);
    }

    /// Injected conflicts not yet consumed.
    pub fn pending_conflicts(&self) -> u32 {
        self.faults.conflicts.load(Ordering::Acquire)
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.faults.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.faults
            .conflicts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_tx_id(&self) -> TxId {
        self.next_tx_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply `tx` to `row`, appending the log entry. Leaves `row` untouched on failure.
    fn apply(&self, row: &mut AccountRow, tx: NewTransaction) -> Result<Transaction> {
        let at = Utc::now();
        let (before, after) = row
            .balance
            .apply(tx.amount, at)
            .ok_or(StoreError::CheckViolation(constraint::BALANCE_NON_NEGATIVE))?;
        let written = Transaction {
            id: self.next_tx_id(),
            user: tx.user,
            kind: tx.kind,
            amount: tx.amount,
            balance_before: before,
            balance_after: after,
            description: tx.description,
            created_at: at,
        };
        row.log.push(written.clone());
        Ok(written)
    }

    fn redemption_count_of(&self, coupon_id: CouponId, user: UserId) -> u32 {
        (0u32..)
            .take_while(|seq| self.redemptions.contains_key(&(coupon_id, user, *seq)))
            .count() as u32
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn account(&self, user: UserId) -> Result<Option<AccountBalance>> {
        self.enter().await?;
        Ok(self.accounts.get(&user).map(|row| row.balance.clone()))
    }

    async fn accounts(&self) -> Result<Vec<AccountBalance>> {
        self.enter().await?;
        Ok(self
            .accounts
            .iter()
            .map(|row| row.balance.clone())
            .collect())
    }

    async fn commit_transaction(
        &self,
        expected_version: u64,
        tx: NewTransaction,
    ) -> Result<(AccountBalance, Transaction)> {
        self.enter().await?;
        if self.take_injected_conflict() {
            warn!(user = tx.user, "injected commit conflict");
            return Err(StoreError::Conflict(tx.user));
        }

        let user = tx.user;
        match self.accounts.entry(user) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                if row.balance.version != expected_version {
                    return Err(StoreError::Conflict(user));
                }
                let written = self.apply(row, tx)?;
                Ok((row.balance.clone(), written))
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StoreError::Conflict(user));
                }
                let mut row = AccountRow {
                    balance: AccountBalance::new(user, Utc::now()),
                    log: Vec::new(),
                };
                // the row only materializes once the first entry applies
                let written = self.apply(&mut row, tx)?;
                let balance = row.balance.clone();
                vacant.insert(row);
                Ok((balance, written))
            }
        }
    }

    async fn transactions(&self, user: UserId) -> Result<Vec<Transaction>> {
        self.enter().await?;
        Ok(self
            .accounts
            .get(&user)
            .map(|row| row.log.clone())
            .unwrap_or_default())
    }

    async fn coupon_by_code(&self, code: &str) -> Result<Option<Coupon>> {
        self.enter().await?;
        Ok(self.coupons.get(code).map(|c| c.value().clone()))
    }

    async fn upsert_coupon(&self, mut coupon: Coupon) -> Result<Coupon> {
        self.enter().await?;
        match self.coupons.entry(coupon.code.clone()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                coupon.id = stored.id;
                coupon.current_uses = stored.current_uses;
                *stored = coupon.clone();
            }
            Entry::Vacant(vacant) => {
                coupon.id = self.next_coupon_id.fetch_add(1, Ordering::Relaxed);
                vacant.insert(coupon.clone());
            }
        }
        Ok(coupon)
    }

    async fn redemption_count(&self, coupon_id: CouponId, user: UserId) -> Result<u32> {
        self.enter().await?;
        Ok(self.redemption_count_of(coupon_id, user))
    }

    async fn redemptions(&self, coupon_id: CouponId) -> Result<Vec<CouponRedemption>> {
        self.enter().await?;
        let mut rows: Vec<_> = self
            .redemptions
            .iter()
            .filter(|r| r.coupon_id == coupon_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.redeemed_at, r.user, r.sequence));
        Ok(rows)
    }

    async fn commit_redemption(&self, unit: RedemptionUnit) -> Result<RedemptionReceipt> {
        self.enter().await?;

        let mut coupon = self
            .coupons
            .get_mut(&unit.code)
            .filter(|c| c.id == unit.coupon_id)
            .ok_or(StoreError::CheckViolation(constraint::COUPON_MISSING))?;
        if !coupon.is_active {
            return Err(StoreError::CheckViolation(constraint::COUPON_ACTIVE));
        }
        if unit.at < coupon.valid_from || unit.at > coupon.valid_until {
            return Err(StoreError::CheckViolation(constraint::COUPON_VALIDITY));
        }
        if coupon.is_exhausted() {
            return Err(StoreError::CheckViolation(constraint::COUPON_MAX_USES));
        }
        if unit.sequence >= coupon.max_uses_per_user {
            return Err(StoreError::CheckViolation(
                constraint::COUPON_MAX_USES_PER_USER,
            ));
        }

        let key = (unit.coupon_id, unit.user, unit.sequence);
        let Entry::Vacant(slot) = self.redemptions.entry(key) else {
            return Err(StoreError::UniqueViolation(constraint::REDEMPTION_UNIQUE));
        };

        let transaction = if unit.points.is_positive() {
            let tx = NewTransaction {
                user: unit.user,
                kind: TransactionKind::CouponGrant,
                amount: unit.points,
                description: unit.description,
            };
            let mut row = self.accounts.entry(unit.user).or_insert_with(|| AccountRow {
                balance: AccountBalance::new(unit.user, unit.at),
                log: Vec::new(),
            });
            Some(self.apply(&mut row, tx)?)
        } else {
            None
        };

        let redemption = CouponRedemption {
            coupon_id: unit.coupon_id,
            user: unit.user,
            sequence: unit.sequence,
            points_granted: transaction
                .as_ref()
                .map(|t| t.amount)
                .unwrap_or(Points::ZERO),
            redeemed_at: unit.at,
        };
        slot.insert(redemption.clone());
        coupon.current_uses += 1;

        Ok(RedemptionReceipt {
            redemption,
            coupon: coupon.value().clone(),
            transaction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Audience, DiscountType};
    use chrono::{DateTime, TimeZone};
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn credit(user: UserId, amount: i64) -> NewTransaction {
        NewTransaction {
            user,
            kind: TransactionKind::Purchase,
            amount: Points::new(amount),
            description: "test".into(),
        }
    }

    fn coupon(code: &str) -> Coupon {
        Coupon {
            id: 0,
            code: code.into(),
            discount_type: DiscountType::Points,
            discount_value: 500,
            valid_from: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            valid_until: Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap(),
            max_uses: Some(100),
            max_uses_per_user: 1,
            target_audience: Audience::All,
            specific_user_ids: HashSet::new(),
            current_uses: 0,
            is_active: true,
        }
    }

    fn unit(coupon: &Coupon, user: UserId, sequence: u32) -> RedemptionUnit {
        RedemptionUnit {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            user,
            sequence,
            points: coupon.points_granted(),
            description: format!("coupon {}", coupon.code),
            at: now(),
        }
    }

    #[tokio::test]
    async fn first_commit_creates_account() {
        let store = MemoryStore::new();
        let (balance, tx) = store.commit_transaction(0, credit(1, 480)).await.unwrap();

        assert_eq!(balance.balance, Points::new(480));
        assert_eq!(balance.version, 1);
        assert_eq!(tx.balance_before, Points::ZERO);
        assert_eq!(tx.balance_after, Points::new(480));
        assert_eq!(store.transactions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemoryStore::new();
        store.commit_transaction(0, credit(1, 100)).await.unwrap();

        let result = store.commit_transaction(0, credit(1, 100)).await;
        assert_eq!(result.unwrap_err(), StoreError::Conflict(1));
        assert_eq!(
            store.account(1).await.unwrap().unwrap().balance,
            Points::new(100)
        );
    }

    #[tokio::test]
    async fn negative_balance_is_rejected_without_writes() {
        let store = MemoryStore::new();
        store.commit_transaction(0, credit(1, 480)).await.unwrap();

        let result = store.commit_transaction(1, credit(1, -500)).await;
        assert_eq!(
            result.unwrap_err(),
            StoreError::CheckViolation(constraint::BALANCE_NON_NEGATIVE)
        );
        assert_eq!(store.transactions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debit_on_absent_account_creates_nothing() {
        let store = MemoryStore::new();
        assert!(store.commit_transaction(0, credit(9, -1)).await.is_err());
        assert!(store.account(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_keeps_id_and_usage() {
        let store = MemoryStore::new();
        let created = store.upsert_coupon(coupon("WELCOME500")).await.unwrap();
        store.commit_redemption(unit(&created, 1, 0)).await.unwrap();

        let mut edited = coupon("WELCOME500");
        edited.discount_value = 250;
        let edited = store.upsert_coupon(edited).await.unwrap();
        assert_eq!(edited.id, created.id);
        assert_eq!(edited.current_uses, 1);
        assert_eq!(edited.discount_value, 250);
    }

    #[tokio::test]
    async fn redemption_is_unique_per_sequence() {
        let store = MemoryStore::new();
        let c = store.upsert_coupon(coupon("WELCOME500")).await.unwrap();

        let receipt = store.commit_redemption(unit(&c, 1, 0)).await.unwrap();
        assert_eq!(receipt.coupon.current_uses, 1);
        assert_eq!(receipt.redemption.points_granted, Points::new(500));
        assert_eq!(
            receipt.transaction.unwrap().kind,
            TransactionKind::CouponGrant
        );

        let dup = store.commit_redemption(unit(&c, 1, 0)).await;
        assert_eq!(
            dup.unwrap_err(),
            StoreError::UniqueViolation(constraint::REDEMPTION_UNIQUE)
        );
        assert_eq!(store.redemption_count(c.id, 1).await.unwrap(), 1);
        assert_eq!(
            store.account(1).await.unwrap().unwrap().balance,
            Points::new(500)
        );
    }

    #[tokio::test]
    async fn redemption_rechecks_caps_inside_unit() {
        let store = MemoryStore::new();
        let mut limited = coupon("ONCE");
        limited.max_uses = Some(1);
        let c = store.upsert_coupon(limited).await.unwrap();

        store.commit_redemption(unit(&c, 1, 0)).await.unwrap();
        assert_eq!(
            store.commit_redemption(unit(&c, 2, 0)).await.unwrap_err(),
            StoreError::CheckViolation(constraint::COUPON_MAX_USES)
        );
        assert_eq!(
            store.commit_redemption(unit(&c, 1, 1)).await.unwrap_err(),
            StoreError::CheckViolation(constraint::COUPON_MAX_USES)
        );
        assert!(store.account(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_point_redemption_writes_no_transaction() {
        let store = MemoryStore::new();
        let mut pct = coupon("TENOFF");
        pct.discount_type = DiscountType::Percentage;
        pct.discount_value = 10;
        let c = store.upsert_coupon(pct).await.unwrap();

        let receipt = store.commit_redemption(unit(&c, 1, 0)).await.unwrap();
        assert!(receipt.transaction.is_none());
        assert_eq!(receipt.redemption.points_granted, Points::ZERO);
        assert!(store.account(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_faults() {
        let store = MemoryStore::new();
        store.inject_conflicts(1);
        assert_eq!(
            store.commit_transaction(0, credit(1, 1)).await.unwrap_err(),
            StoreError::Conflict(1)
        );
        assert_eq!(store.pending_conflicts(), 0);
        store.commit_transaction(0, credit(1, 1)).await.unwrap();

        store.set_unavailable(true);
        assert!(matches!(
            store.account(1).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.account(1).await.unwrap().is_some());
    }
}
