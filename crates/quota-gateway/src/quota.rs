//! Fixed daily request quota per namespace.
//!
//! The admission window is the calendar day in server-local time. The reset
//! time reported to callers is computed differently: the earliest request of
//! the day plus 24 hours, or the next local midnight when there is none. The
//! two do not always agree.
//!
//! Check and insert are separate store calls. Concurrent admissions near the
//! limit can each observe a count below it, so the realized count may exceed
//! the limit by the number of racers minus one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone};
use serde::Serialize;
use thiserror::Error;

use crate::error::GatewayError;
use crate::store::{StoreError, UsageStore};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Step and bound used to find the first wall-clock time of a day whose
/// midnight was skipped by a DST jump.
const DAY_START_STEP_MINUTES: i64 = 15;
const DAY_START_MAX_STEPS: i64 = 16;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("daily request limit ({limit}) exceeded")]
    Exceeded { limit: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<QuotaError> for GatewayError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded { limit } => GatewayError::RateLimitExceeded { limit },
            QuotaError::Store(e) => e.into(),
        }
    }
}

/// A slot consumed by an admitted request, pending settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub record_id: i64,
    pub namespace: String,
}

/// Usage summary returned by the `/usage` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub total_limit: i64,
    pub used_today: i64,
    pub remaining_today: i64,
    /// Epoch milliseconds.
    pub next_reset_time: i64,
}

/// Bounds of the calendar day containing some instant, in that instant's
/// time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start_ms: i64,
    /// Last millisecond of the day (inclusive).
    pub end_ms: i64,
    pub next_midnight_ms: i64,
}

impl DayWindow {
    pub fn containing<Tz: TimeZone>(now: DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let today = now.date_naive();
        let tomorrow = today.succ_opt().unwrap_or(NaiveDate::MAX);
        let start_ms = day_start(&tz, today).timestamp_millis();
        let next_midnight_ms = day_start(&tz, tomorrow).timestamp_millis();
        Self {
            start_ms,
            end_ms: next_midnight_ms - 1,
            next_midnight_ms,
        }
    }
}

/// Earliest valid instant of `date` in `tz`. Usually midnight; when a DST
/// jump skips midnight, the first wall-clock time after the gap.
fn day_start<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = date.and_time(NaiveTime::MIN);
    (0..=DAY_START_MAX_STEPS)
        .map(|step| midnight + Duration::minutes(step * DAY_START_STEP_MINUTES))
        .find_map(|local| tz.from_local_datetime(&local).earliest())
        .unwrap_or_else(|| tz.from_utc_datetime(&midnight))
}

pub struct QuotaEnforcer {
    store: Arc<dyn UsageStore>,
    daily_limit: i64,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn UsageStore>, daily_limit: i64) -> Self {
        Self { store, daily_limit }
    }

    pub fn daily_limit(&self) -> i64 {
        self.daily_limit
    }

    /// Admit a request for `namespace` now.
    pub async fn admit(&self, namespace: &str) -> Result<Admission, QuotaError> {
        self.admit_at(namespace, Local::now()).await
    }

    /// Admit a request at a provided time (useful for tests).
    pub async fn admit_at(
        &self,
        namespace: &str,
        now: DateTime<Local>,
    ) -> Result<Admission, QuotaError> {
        let window = DayWindow::containing(now);
        let used = self
            .store
            .count_in_window(namespace, window.start_ms, window.end_ms)
            .await?;
        if used >= self.daily_limit {
            log::debug!(
                "namespace {namespace} rejected: {used}/{} used today",
                self.daily_limit
            );
            return Err(QuotaError::Exceeded {
                limit: self.daily_limit,
            });
        }

        let record_id = self
            .store
            .insert_usage(namespace, now.timestamp_millis())
            .await?;
        Ok(Admission {
            record_id,
            namespace: namespace.to_string(),
        })
    }

    /// Reconcile an admission with the outcome of the relayed request. A
    /// failed request gives its slot back; a failed rollback is only logged.
    pub async fn settle(&self, admission: &Admission, succeeded: bool) {
        if succeeded {
            return;
        }
        match self.store.delete_usage(admission.record_id).await {
            Ok(true) => log::debug!(
                "released usage record {} for namespace {}",
                admission.record_id,
                admission.namespace
            ),
            Ok(false) => log::warn!(
                "usage record {} for namespace {} was already gone",
                admission.record_id,
                admission.namespace
            ),
            Err(e) => log::error!(
                "failed to delete usage record {} for failed request in namespace {}: {}",
                admission.record_id,
                admission.namespace,
                e
            ),
        }
    }

    pub async fn usage(&self, namespace: &str) -> Result<UsageReport, QuotaError> {
        self.usage_at(namespace, Local::now()).await
    }

    pub async fn usage_at(
        &self,
        namespace: &str,
        now: DateTime<Local>,
    ) -> Result<UsageReport, QuotaError> {
        let window = DayWindow::containing(now);
        let used_today = self
            .store
            .count_in_window(namespace, window.start_ms, window.end_ms)
            .await?;
        let next_reset_time = match self
            .store
            .earliest_in_window(namespace, window.start_ms, window.end_ms)
            .await?
        {
            Some(earliest) => earliest + DAY_MS,
            None => window.next_midnight_ms,
        };

        Ok(UsageReport {
            total_limit: self.daily_limit,
            used_today,
            remaining_today: (self.daily_limit - used_today).max(0),
            next_reset_time,
        })
    }
}
