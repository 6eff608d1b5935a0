// ============================================================================
// ADAPTIVE POLL INTERVAL
// ============================================================================
// The poll cadence follows how often the metrics endpoint is scraped. Every
// poll task reads one shared interval; the scrape path retunes it.
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::{INTERVAL_DRIFT_TOLERANCE_SECS, MIN_INTERVAL_SECS};

// ----------------------------------------------------------------------------
// Shared Interval
// ----------------------------------------------------------------------------

/// Poll interval shared by all poll tasks, always within
/// `[MIN_INTERVAL_SECS, max_secs]`.
#[derive(Debug)]
pub struct PollInterval {
    secs: AtomicU64,
    max_secs: u64,
}

impl PollInterval {
    pub fn new(initial_secs: u64, max_secs: u64) -> Self {
        let max_secs = max_secs.max(MIN_INTERVAL_SECS);
        Self {
            secs: AtomicU64::new(initial_secs.clamp(MIN_INTERVAL_SECS, max_secs)),
            max_secs,
        }
    }

    /// Retune from an observed scrape period. Polls run one second ahead of
    /// scrapes so a scrape never lands just before fresh data arrives.
    pub fn update(&self, observed_secs: u64) -> u64 {
        let target = observed_secs
            .saturating_sub(1)
            .clamp(MIN_INTERVAL_SECS, self.max_secs);
        self.secs.store(target, AtomicOrdering::Release);
        target
    }

    pub fn secs(&self) -> u64 {
        self.secs.load(AtomicOrdering::Acquire)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.secs())
    }

    pub fn max_secs(&self) -> u64 {
        self.max_secs
    }
}

// ----------------------------------------------------------------------------
// Scrape-Driven Controller
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ScrapeState {
    last_scrape: Instant,
    last_interval: u64,
}

/// Watches scrape arrivals and propagates the observed period to the
/// shared [`PollInterval`] when it drifts by more than one second.
#[derive(Debug)]
pub struct IntervalController {
    interval: Arc<PollInterval>,
    state: Mutex<ScrapeState>,
}

impl IntervalController {
    pub fn new(interval: Arc<PollInterval>) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Arc<PollInterval>, start: Instant) -> Self {
        Self {
            interval,
            state: Mutex::new(ScrapeState {
                last_scrape: start,
                last_interval: 0,
            }),
        }
    }

    /// Record a scrape happening now.
    pub fn on_scrape(&self) -> Option<u64> {
        self.observe(Instant::now())
    }

    /// Record a scrape at `at`. Returns the new poll interval when it changed.
    pub fn observe(&self, at: Instant) -> Option<u64> {
        let mut state = self.state.lock();
        let elapsed = at.saturating_duration_since(state.last_scrape).as_secs();
        state.last_scrape = at;

        if elapsed.abs_diff(state.last_interval) <= INTERVAL_DRIFT_TOLERANCE_SECS {
            return None;
        }

        state.last_interval = elapsed;
        let applied = self.interval.update(elapsed);
        debug!(
            target: "anka_exporter::interval",
            scrape_period_secs = elapsed,
            poll_interval_secs = applied,
            "Poll interval retuned"
        );
        Some(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(61, 60)]
    #[case(600, 60)]
    #[case(5, 4)]
    #[case(2, 2)]
    #[case(1, 2)]
    #[case(0, 2)]
    fn test_update_clamps(#[case] observed: u64, #[case] expected: u64) {
        let interval = PollInterval::new(15, 60);
        assert_eq!(interval.update(observed), expected);
        assert_eq!(interval.secs(), expected);
    }

    #[test]
    fn test_initial_value_is_clamped() {
        assert_eq!(PollInterval::new(1, 60).secs(), 2);
        assert_eq!(PollInterval::new(90, 60).secs(), 60);
        assert_eq!(PollInterval::new(15, 60).duration(), Duration::from_secs(15));
    }

    #[test]
    fn test_controller_hysteresis() {
        let interval = Arc::new(PollInterval::new(15, 60));
        let start = Instant::now();
        let controller = IntervalController::starting_at(interval.clone(), start);

        assert_eq!(controller.observe(start + Duration::from_secs(30)), Some(29));
        assert_eq!(interval.secs(), 29);

        // same period, and within one second of it
        assert_eq!(controller.observe(start + Duration::from_secs(60)), None);
        assert_eq!(controller.observe(start + Duration::from_secs(91)), None);
        assert_eq!(interval.secs(), 29);

        assert_eq!(controller.observe(start + Duration::from_secs(101)), Some(9));
        assert_eq!(interval.secs(), 9);
    }

    #[test]
    fn test_first_quick_scrape_is_ignored() {
        let interval = Arc::new(PollInterval::new(15, 60));
        let start = Instant::now();
        let controller = IntervalController::starting_at(interval.clone(), start);

        assert_eq!(controller.observe(start + Duration::from_secs(1)), None);
        assert_eq!(interval.secs(), 15);
    }
}
