// ============================================================================
// CARDINALITY GUARD
// ============================================================================
// A labeled gauge vector keeps every label combination it has ever seen.
// When the set of upstream entities shrinks, series for the vanished ones
// would keep their last value forever. The guard tracks how many entities
// fed each vector and tells the caller when to clear it.
// ============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::GaugeVec;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct CardinalityRecord {
    count: usize,
    last_reset: Instant,
}

/// Per-metric entity counts with a per-metric reset clock.
#[derive(Debug)]
pub struct CardinalityGuard {
    ttl: Duration,
    records: Mutex<HashMap<String, CardinalityRecord>>,
}

impl CardinalityGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when `metric` must be cleared before writing `count`
    /// fresh series.
    ///
    /// The first observation only records. Afterwards a reset is signalled
    /// when the count changed, or when the TTL has elapsed since the last
    /// reset of this metric. A previous count of zero never signals, since
    /// there is nothing stale to clear.
    pub fn check_and_reset(&self, metric: &str, count: usize) -> bool {
        self.check_and_reset_at(metric, count, Instant::now())
    }

    pub(crate) fn check_and_reset_at(&self, metric: &str, count: usize, now: Instant) -> bool {
        let mut records = self.records.lock();

        let Some(record) = records.get_mut(metric) else {
            records.insert(
                metric.to_string(),
                CardinalityRecord {
                    count,
                    last_reset: now,
                },
            );
            return false;
        };

        let expired = now.saturating_duration_since(record.last_reset) >= self.ttl;
        let reset = record.count != 0 && (record.count != count || expired);

        record.count = count;
        if reset {
            record.last_reset = now;
        }
        reset
    }

    /// Clear `vec` if [`check_and_reset`](Self::check_and_reset) says so.
    pub fn reset_vec_if_needed(&self, metric: &str, count: usize, vec: &GaugeVec) -> bool {
        let reset = self.check_and_reset(metric, count);
        if reset {
            vec.reset();
            debug!(
                target: "anka_exporter::cardinality",
                metric = metric,
                count = count,
                "Cleared labeled series"
            );
        }
        reset
    }

    /// Last recorded entity count for `metric`
    pub fn tracked(&self, metric: &str) -> Option<usize> {
        self.records.lock().get(metric).map(|r| r.count)
    }
}
