//! Cost ceilings per UTC calendar day and month.
//!
//! Every billable call first reserves its estimated cost. The reservation is
//! checked against both ceilings, counting spend already settled plus every
//! reservation still outstanding, so concurrent requests cannot jointly
//! overshoot. Settling replaces the estimate with the actual billed cost.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::Failure;
use crate::types::config::QuotaConfig;

/// Source of wall-clock time for window rollover.
pub trait QuotaClock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl QuotaClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Snapshot of spend in the current windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub daily_spent: f64,
    pub monthly_spent: f64,

    /// Estimated cost of reservations not yet settled
    pub pending: f64,

    pub daily_remaining: f64,
    pub monthly_remaining: f64,
}

#[derive(Debug)]
struct Ledger {
    day: NaiveDate,
    month: (i32, u32),
    daily_spent: f64,
    monthly_spent: f64,
    pending: f64,
}

impl Ledger {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            month: (now.year(), now.month()),
            daily_spent: 0.0,
            monthly_spent: 0.0,
            pending: 0.0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            info!(previous = %self.day, spent = self.daily_spent, "Daily quota window reset");
            self.day = day;
            self.daily_spent = 0.0;
        }

        let month = (now.year(), now.month());
        if month != self.month {
            info!(spent = self.monthly_spent, "Monthly quota window reset");
            self.month = month;
            self.monthly_spent = 0.0;
        }
    }
}

/// Shared cost guard.
#[derive(Clone)]
pub struct QuotaGuard {
    config: QuotaConfig,
    clock: Arc<dyn QuotaClock>,
    ledger: Arc<Mutex<Ledger>>,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QuotaConfig, clock: Arc<dyn QuotaClock>) -> Self {
        let ledger = Ledger::new(clock.now());
        Self {
            config,
            clock,
            ledger: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Reserve `estimated` against both ceilings.
    ///
    /// Fails with `QuotaExceeded` (non-retryable) if settled spend plus
    /// outstanding reservations plus this estimate would exceed either one.
    pub fn reserve(&self, estimated: f64) -> Result<QuotaReservation, Failure> {
        let estimated = estimated.max(0.0);
        let mut ledger = lock(&self.ledger);
        ledger.roll(self.clock.now());

        let daily_total = ledger.daily_spent + ledger.pending + estimated;
        if daily_total > self.config.daily_ceiling {
            warn!(
                spent = ledger.daily_spent,
                pending = ledger.pending,
                estimated,
                ceiling = self.config.daily_ceiling,
                "Daily quota would be exceeded"
            );
            return Err(Failure::quota_exceeded(format!(
                "daily ceiling {:.2} reached ({:.4} spent, {:.4} pending, {:.4} requested)",
                self.config.daily_ceiling, ledger.daily_spent, ledger.pending, estimated
            )));
        }

        let monthly_total = ledger.monthly_spent + ledger.pending + estimated;
        if monthly_total > self.config.monthly_ceiling {
            warn!(
                spent = ledger.monthly_spent,
                pending = ledger.pending,
                estimated,
                ceiling = self.config.monthly_ceiling,
                "Monthly quota would be exceeded"
            );
            return Err(Failure::quota_exceeded(format!(
                "monthly ceiling {:.2} reached ({:.4} spent, {:.4} pending, {:.4} requested)",
                self.config.monthly_ceiling, ledger.monthly_spent, ledger.pending, estimated
            )));
        }

        ledger.pending += estimated;
        debug!(estimated, pending = ledger.pending, "Quota reserved");

        Ok(QuotaReservation {
            ledger: self.ledger.clone(),
            clock: self.clock.clone(),
            estimated,
            settled: false,
        })
    }

    /// Settle a reservation with the cost actually billed.
    pub fn settle(&self, reservation: QuotaReservation, actual: f64) {
        reservation.settle(actual);
    }

    pub fn usage(&self) -> QuotaUsage {
        let mut ledger = lock(&self.ledger);
        ledger.roll(self.clock.now());

        QuotaUsage {
            daily_spent: ledger.daily_spent,
            monthly_spent: ledger.monthly_spent,
            pending: ledger.pending,
            daily_remaining: (self.config.daily_ceiling - ledger.daily_spent - ledger.pending).max(0.0),
            monthly_remaining: (self.config.monthly_ceiling - ledger.monthly_spent - ledger.pending)
                .max(0.0),
        }
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("config", &self.config)
            .field("usage", &self.usage())
            .finish()
    }
}

/// Outstanding reservation.
///
/// Dropping it unsettled (cancelled call) settles it at the estimate.
#[derive(Debug)]
#[must_use = "a reservation should be settled with the actual billed cost"]
pub struct QuotaReservation {
    ledger: Arc<Mutex<Ledger>>,
    clock: Arc<dyn QuotaClock>,
    estimated: f64,
    settled: bool,
}

impl QuotaReservation {
    pub fn estimated(&self) -> f64 {
        self.estimated
    }

    pub fn settle(mut self, actual: f64) {
        self.apply(actual.max(0.0));
    }

    fn apply(&mut self, actual: f64) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut ledger = lock(&self.ledger);
        ledger.roll(self.clock.now());
        ledger.pending = (ledger.pending - self.estimated).max(0.0);
        ledger.daily_spent += actual;
        ledger.monthly_spent += actual;
        debug!(estimated = self.estimated, actual, "Quota settled");
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        let estimated = self.estimated;
        self.apply(estimated);
    }
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
