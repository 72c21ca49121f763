use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

pub const MAX_DAILY_DELIVERIES: u32 = 20;

#[derive(Debug, Clone, Copy)]
struct DailyCount {
    day: NaiveDate,
    count: u32,
    last_assigned_at: DateTime<Utc>,
}

/// Per-driver cooldown expiries and engine-side daily assignment counts.
///
/// Every mutation is keyed by driver id, so concurrent dispatchers only contend
/// when they touch the same driver.
#[derive(Debug, Default)]
pub struct CooldownStore {
    cooldowns: DashMap<Uuid, Instant>,
    daily: DashMap<Uuid, DailyCount>,
}

impl CooldownStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_cooldown(&self, driver_id: &Uuid) -> bool {
        let now = Instant::now();
        let expired = match self.cooldowns.get(driver_id) {
            Some(expires_at) if *expires_at > now => return true,
            Some(_) => true,
            None => false,
        };

        if expired {
            self.cooldowns.remove_if(driver_id, |_, expires_at| *expires_at <= now);
        }
        false
    }

    /// Overwrites any existing cooldown for the driver.
    pub fn set_cooldown(&self, driver_id: Uuid, duration: Duration) {
        self.cooldowns.insert(driver_id, Instant::now() + duration);
    }

    pub fn set_cooldowns<'a>(&self, driver_ids: impl IntoIterator<Item = &'a Uuid>, duration: Duration) {
        let expires_at = Instant::now() + duration;
        for driver_id in driver_ids {
            self.cooldowns.insert(*driver_id, expires_at);
        }
    }

    /// Only the peak-hour escalation policy lifts a cooldown early.
    pub fn remove_cooldown(&self, driver_id: &Uuid) -> bool {
        self.cooldowns.remove(driver_id).is_some()
    }

    pub fn active_cooldowns(&self) -> usize {
        let now = Instant::now();
        self.cooldowns
            .iter()
            .filter(|entry| *entry.value() > now)
            .count()
    }

    pub fn record_assignment(&self, driver_id: Uuid, at: DateTime<Utc>) {
        let day = at.date_naive();
        self.daily
            .entry(driver_id)
            .and_modify(|entry| {
                if entry.day == day {
                    entry.count = entry.count.saturating_add(1);
                } else {
                    entry.day = day;
                    entry.count = 1;
                }
                entry.last_assigned_at = entry.last_assigned_at.max(at);
            })
            .or_insert(DailyCount {
                day,
                count: 1,
                last_assigned_at: at,
            });
    }

    /// Assignments this engine made for the driver on the current UTC day.
    pub fn assignments_today(&self, driver_id: &Uuid, now: DateTime<Utc>) -> u32 {
        self.daily
            .get(driver_id)
            .filter(|entry| entry.day == now.date_naive())
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    pub fn last_assignment_at(&self, driver_id: &Uuid) -> Option<DateTime<Utc>> {
        self.daily.get(driver_id).map(|entry| entry.last_assigned_at)
    }
}

/// `max(0, 1 - deliveries_today / 20)`.
pub fn fairness_score(deliveries_today: u32) -> f64 {
    (1.0 - deliveries_today as f64 / MAX_DAILY_DELIVERIES as f64).max(0.0)
}

/// One hour or more since the last assignment saturates at 1. Never assigned counts as rested.
pub fn recency_score(last_assignment_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last) = last_assignment_at else {
        return 1.0;
    };

    let hours_since = (now - last).num_milliseconds() as f64 / 3_600_000.0;
    hours_since.clamp(0.0, 1.0)
}
