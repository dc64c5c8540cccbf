use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Label used for requests that never resolved to a namespace.
pub const ANONYMOUS: &str = "<anonymous>";

/// Minutes of history kept per namespace.
pub const DEFAULT_RETENTION_MINUTES: u64 = 60;

type StatusCounts = HashMap<u16, u64>;

#[derive(Default)]
struct Buckets {
    by_namespace: HashMap<String, BTreeMap<u64, StatusCounts>>,
    /// Newest minute the retention sweep has run for.
    swept_minute: u64,
}

/// Response status counts of one namespace for one finished minute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinuteSummary {
    pub namespace: String,
    /// Minutes since the Unix epoch.
    pub minute: u64,
    /// `(status, count)` ordered by status.
    pub counts: Vec<(u16, u64)>,
}

impl MinuteSummary {
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, n)| n).sum()
    }
}

impl fmt::Display for MinuteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "namespace {} minute {}: {} requests",
            self.namespace,
            self.minute,
            self.total()
        )?;
        for (status, count) in &self.counts {
            write!(f, " {status}={count}")?;
        }
        Ok(())
    }
}

/// In-memory per-minute response status counts keyed by namespace, kept for
/// a bounded number of minutes. Observability only; admission never reads
/// these.
pub struct Metrics {
    retention_minutes: u64,
    buckets: Mutex<Buckets>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION_MINUTES)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention_minutes: u64) -> Self {
        Self {
            retention_minutes: retention_minutes.max(1),
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Record a status code occurrence using the current wall-clock time.
    /// Returns the namespace's previous minute once a sample opens a new one.
    pub fn record(&self, namespace: &str, status: u16) -> Option<MinuteSummary> {
        self.record_at(namespace, status, SystemTime::now())
    }

    /// Record a status code occurrence at a provided time (useful for tests).
    pub fn record_at(&self, namespace: &str, status: u16, at: SystemTime) -> Option<MinuteSummary> {
        let minute = Self::minute_bucket(at);
        let Ok(mut buckets) = self.buckets.lock() else {
            log::warn!("metrics store poisoned, dropping sample");
            return None;
        };

        if minute > buckets.swept_minute {
            let oldest = minute.saturating_sub(self.retention_minutes - 1);
            buckets.by_namespace.retain(|_, minutes| {
                *minutes = minutes.split_off(&oldest);
                !minutes.is_empty()
            });
            buckets.swept_minute = minute;
        }

        let minutes = buckets.by_namespace.entry(namespace.to_string()).or_default();
        let finished = if minutes.contains_key(&minute) {
            None
        } else {
            minutes
                .range(..minute)
                .next_back()
                .map(|(m, counts)| MinuteSummary {
                    namespace: namespace.to_string(),
                    minute: *m,
                    counts: sorted(counts),
                })
        };
        *minutes.entry(minute).or_default().entry(status).or_insert(0) += 1;
        finished
    }

    /// Snapshot counts for a namespace. Returns an empty map when unknown.
    pub fn snapshot(&self, namespace: &str) -> HashMap<u64, StatusCounts> {
        self.buckets
            .lock()
            .ok()
            .and_then(|buckets| {
                buckets
                    .by_namespace
                    .get(namespace)
                    .map(|minutes| minutes.iter().map(|(m, c)| (*m, c.clone())).collect())
            })
            .unwrap_or_default()
    }

    /// Counts per status summed over the retained minutes.
    pub fn totals(&self, namespace: &str) -> StatusCounts {
        let mut totals = HashMap::new();
        for counts in self.snapshot(namespace).values() {
            for (code, count) in counts {
                *totals.entry(*code).or_insert(0) += *count;
            }
        }
        totals
    }

    fn minute_bucket(at: SystemTime) -> u64 {
        at.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
            / 60
    }
}

fn sorted(counts: &StatusCounts) -> Vec<(u16, u64)> {
    let mut counts: Vec<_> = counts.iter().map(|(s, n)| (*s, *n)).collect();
    counts.sort_unstable();
    counts
}
