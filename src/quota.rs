//! Daily action counter per `(user, counterparty)`.
//!
//! The service-local calendar date is part of the key, so a new day starts
//! from zero without any reset job. `cleanup` only bounds memory.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::config::{ConfigError, QuotaConfig};
use crate::error::ThrottleError;
use crate::model::{CounterpartyId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub current: u32,
    pub limit: u32,
}

type Key = (UserId, CounterpartyId, NaiveDate);

#[derive(Debug)]
pub struct QuotaTracker {
    limit: u32,
    offset: FixedOffset,
    retention_days: u32,
    counters: DashMap<Key, u32>,
}

impl QuotaTracker {
    pub fn new(config: &QuotaConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            limit: config.daily_limit,
            offset: config.offset()?,
            retention_days: config.retention_days,
            counters: DashMap::new(),
        })
    }

    /// Calendar date of `now` in the service-local timezone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Read-only view of today's counter.
    pub fn check(
        &self,
        user: UserId,
        counterparty: CounterpartyId,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        let key = (user, counterparty, self.local_date(now));
        let current = self.counters.get(&key).map(|c| *c).unwrap_or(0);
        self.decision(current)
    }

    /// Count one action unconditionally, returning today's new total.
    pub fn record(&self, user: UserId, counterparty: CounterpartyId, now: DateTime<Utc>) -> u32 {
        let key = (user, counterparty, self.local_date(now));
        let mut count = self.counters.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Count one action if today's quota allows it. Check and increment are
    /// a single step under the counter's lock.
    pub fn try_record(
        &self,
        user: UserId,
        counterparty: CounterpartyId,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, ThrottleError> {
        let key = (user, counterparty, self.local_date(now));
        let mut count = self.counters.entry(key).or_insert(0);
        if *count >= self.limit {
            let current = *count;
            drop(count);
            info!(user, counterparty, current, "daily quota exceeded");
            return Err(ThrottleError::DailyQuotaExceeded {
                counterparty,
                retry_after_secs: self.seconds_until_reset(now),
            });
        }
        *count += 1;
        Ok(self.decision(*count))
    }

    /// Give back an action counted by `try_record` whose operation failed.
    pub fn release(&self, user: UserId, counterparty: CounterpartyId, now: DateTime<Utc>) {
        let key = (user, counterparty, self.local_date(now));
        if let Entry::Occupied(mut occupied) = self.counters.entry(key) {
            if *occupied.get() <= 1 {
                occupied.remove();
            } else {
                *occupied.get_mut() -= 1;
            }
        }
    }

    /// Administrative reset of today's counters for `user`, for one
    /// counterparty or all of them. Returns the number of rows removed.
    pub fn reset(
        &self,
        user: UserId,
        counterparty: Option<CounterpartyId>,
        now: DateTime<Utc>,
    ) -> usize {
        let today = self.local_date(now);
        let removed = match counterparty {
            Some(cp) => usize::from(self.counters.remove(&(user, cp, today)).is_some()),
            None => {
                let before = self.counters.len();
                self.counters
                    .retain(|(u, _, date), _| !(*u == user && *date == today));
                before.saturating_sub(self.counters.len())
            }
        };
        info!(user, ?counterparty, removed, "daily quota reset");
        removed
    }

    /// Drop counters older than the retention horizon.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let today = self.local_date(now);
        let Some(horizon) = today.checked_sub_days(Days::new(u64::from(self.retention_days))) else {
            return 0;
        };
        let before = self.counters.len();
        self.counters.retain(|(_, _, date), _| *date >= horizon);
        let removed = before.saturating_sub(self.counters.len());
        debug!(removed, %horizon, "daily quota cleanup");
        removed
    }

    pub fn clear(&self) {
        self.counters.clear();
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn decision(&self, current: u32) -> QuotaDecision {
        QuotaDecision {
            allowed: current < self.limit,
            remaining: self.limit.saturating_sub(current),
            current,
            limit: self.limit,
        }
    }

    /// Seconds until the next service-local midnight.
    fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let local = now.with_timezone(&self.offset).naive_local();
        local
            .date()
            .succ_opt()
            .map(|tomorrow| (tomorrow.and_time(NaiveTime::MIN) - local).num_seconds())
            .unwrap_or(0)
            .max(0) as u64
    }
}
