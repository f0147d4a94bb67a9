//! Source quality tracking, used to pick which active source a new request
//! goes to and to decide when a source should be evicted in favour of a
//! replacement.
//!
//! Lower is better: a quality score is modeled on elapsed-microseconds per
//! kilobyte read, so a fast source has a small number. This mirrors the
//! EWMA-driven window update in
//! `protocols::tcp::established::state::congestion_ctrl::cubic`, but
//! tracks cost rather than a congestion window, and decays geometrically
//! toward a neutral baseline on idle ticks rather than growing.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use derive_more::{Display, From};
use histogram::Histogram;

/// A source's standing: lower is better. New sources start at
/// [`NEUTRAL_QUALITY`] so they compete fairly against seasoned ones
/// until enough samples accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, From)]
pub struct Quality(pub i64);

/// The score assigned to a source with no completed requests yet, and the
/// level idle sources decay back toward.
pub const NEUTRAL_QUALITY: Quality = Quality(1_000);

/// A source that has just been told a request failed against it is pinned
/// here until the next periodic check evicts it: far enough above the high
/// watermark that it always reads as eviction-worthy.
pub const FAILED_QUALITY: Quality = Quality(i64::MAX / 2);

/// Tracks one source's rolling quality. Implementations must be safe to
/// call from multiple wire-completion threads concurrently: a `Source`
/// hands out `Arc<dyn QualityMetric>` and every inflight request's
/// completion calls into it independently.
pub trait QualityMetric: Send + Sync {
    /// Current score, read by the periodic source check and by request
    /// dispatch when picking among active sources. Lower is better.
    fn score(&self) -> Quality;

    /// Starts tracking one outstanding request of `size` bytes, returning a
    /// watch that must be resolved by calling [`ActiveWatch::stop`] or
    /// [`ActiveWatch::discard`] exactly once.
    fn start(self: std::sync::Arc<Self>, size: u64) -> ActiveWatch;

    /// Forces the score high enough to guarantee eviction at the next
    /// periodic check.
    fn record_failure(&self);

    /// Folds a completed request's latency and size into the score. Called
    /// by [`ActiveWatch::stop`]; metrics that ignore traffic (like
    /// [`FixedQualityMetric`]) leave this as a no-op.
    fn record(&self, _elapsed: Duration, _size: u64) {}

    /// Called periodically for every active source, including idle ones,
    /// so a source with no recent traffic can still be compared fairly
    /// against one serving requests right now, and so a source that once
    /// failed eventually decays back toward neutral rather than staying
    /// pinned at [`FAILED_QUALITY`] forever.
    fn idle_tick(&self) {}
}

/// An in-flight sample taken out of a [`QualityMetric`] when a request is
/// dispatched. Exactly one of [`ActiveWatch::stop`] / [`ActiveWatch::discard`]
/// must be called when the request completes.
pub struct ActiveWatch {
    start: Instant,
    size: u64,
    metric: std::sync::Arc<dyn QualityMetric>,
    resolved: bool,
}

impl ActiveWatch {
    fn new(start: Instant, size: u64, metric: std::sync::Arc<dyn QualityMetric>) -> Self {
        Self {
            start,
            size,
            metric,
            resolved: false,
        }
    }

    /// Folds the observed latency and size into the owning metric. Called
    /// on successful completion.
    pub fn stop(mut self) {
        self.resolved = true;
        self.metric.record(self.start.elapsed(), self.size);
    }

    /// Drops the sample without folding it into the metric, then forces
    /// the metric's score up via [`QualityMetric::record_failure`]: the
    /// failing source's score is pinned to [`FAILED_QUALITY`] immediately
    /// so the very next periodic check evicts it.
    pub fn discard(mut self) {
        self.resolved = true;
        self.metric.record_failure();
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        if !self.resolved {
            // A watch dropped without an explicit stop/discard is a bug in
            // the calling code; treat it the same as an explicit failure
            // rather than silently losing the sample.
            self.metric.record_failure();
        }
    }
}

/// The production `QualityMetric`: an exponentially weighted moving average
/// of elapsed-microseconds-per-kilobyte, combined with a `histogram` of raw
/// observed latencies for diagnostics.
pub struct DecayingQualityMetric {
    // Fixed-point us/KB, scaled by `SCALE`, so the smoothing update can be
    // done with integer atomics instead of a lock around a float.
    score: AtomicI64,
    failed: std::sync::atomic::AtomicBool,
    latency_us: Mutex<Histogram>,
    samples: AtomicU64,
    smoothing: f64,
}

const SCALE: f64 = 1_000.0;

impl DecayingQualityMetric {
    /// `smoothing` is the EWMA weight given to each new sample, in `(0, 1]`;
    /// `0.2` is used by default, the same weight XRootD's own bandwidth
    /// estimator defaults to.
    pub fn new(smoothing: f64) -> Self {
        Self {
            score: AtomicI64::new(NEUTRAL_QUALITY.0 * (SCALE as i64)),
            failed: std::sync::atomic::AtomicBool::new(false),
            latency_us: Mutex::new(Histogram::new()),
            samples: AtomicU64::new(0),
            smoothing,
        }
    }

    fn record(&self, elapsed: Duration, size: u64) {
        let micros = elapsed.as_micros().max(1) as u64;
        if let Ok(mut hist) = self.latency_us.lock() {
            let _ = hist.increment(micros);
        }

        let kilobytes = (size as f64 / 1024.0).max(1e-6);
        let cost = micros as f64 / kilobytes;
        let prev = self.score.load(Ordering::Relaxed) as f64 / SCALE;
        let next = if self.samples.fetch_add(1, Ordering::Relaxed) == 0 {
            cost
        } else {
            self.smoothing * cost + (1.0 - self.smoothing) * prev
        };
        self.score.store((next * SCALE) as i64, Ordering::Relaxed);
        self.failed.store(false, Ordering::Relaxed);
    }

    /// Median observed latency in microseconds, or `None` if no request has
    /// completed yet. Surfaced through `RequestManager` diagnostics, not
    /// used in source selection.
    pub fn median_latency_us(&self) -> Option<u64> {
        self.latency_us.lock().ok()?.percentile(0.5).ok()
    }
}

impl QualityMetric for DecayingQualityMetric {
    fn score(&self) -> Quality {
        if self.failed.load(Ordering::Relaxed) {
            return FAILED_QUALITY;
        }
        Quality(self.score.load(Ordering::Relaxed) / (SCALE as i64))
    }

    fn start(self: std::sync::Arc<Self>, size: u64) -> ActiveWatch {
        ActiveWatch::new(Instant::now(), size, self)
    }

    fn record_failure(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    fn record(&self, elapsed: Duration, size: u64) {
        DecayingQualityMetric::record(self, elapsed, size)
    }

    fn idle_tick(&self) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }
        let prev = self.score.load(Ordering::Relaxed) as f64 / SCALE;
        let neutral = NEUTRAL_QUALITY.0 as f64;
        // Geometric decay back toward neutral, same shape as `cubic`'s
        // window relaxation: move a fixed fraction of the remaining
        // distance each tick rather than jumping straight to neutral.
        let next = neutral + (prev - neutral) * 0.5;
        self.score.store((next * SCALE) as i64, Ordering::Relaxed);
    }
}

impl fmt::Debug for DecayingQualityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecayingQualityMetric")
            .field("score", &self.score())
            .field("samples", &self.samples.load(Ordering::Relaxed))
            .finish()
    }
}

/// A metric that always reports a score fixed at construction, regardless
/// of traffic. Used by this crate's own tests to make eviction and
/// round-robin toggling assertions independent of wall-clock timing
/// (gated behind the `test-util` feature).
#[derive(Debug)]
pub struct FixedQualityMetric {
    score: AtomicI64,
}

impl FixedQualityMetric {
    pub fn new(score: Quality) -> Self {
        Self {
            score: AtomicI64::new(score.0),
        }
    }

    pub fn set(&self, score: Quality) {
        self.score.store(score.0, Ordering::Relaxed);
    }
}

impl QualityMetric for FixedQualityMetric {
    fn score(&self) -> Quality {
        Quality(self.score.load(Ordering::Relaxed))
    }

    fn start(self: std::sync::Arc<Self>, size: u64) -> ActiveWatch {
        ActiveWatch::new(Instant::now(), size, self)
    }

    fn record_failure(&self) {
        self.score.store(FAILED_QUALITY.0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn neutral_until_first_sample() {
        let metric = Arc::new(DecayingQualityMetric::new(0.2));
        assert_eq!(metric.score(), NEUTRAL_QUALITY);
    }

    #[test]
    fn failure_pins_score_above_any_real_watermark() {
        let metric = Arc::new(DecayingQualityMetric::new(0.2));
        metric.clone().start(1024).discard();
        assert_eq!(metric.score(), FAILED_QUALITY);
    }

    #[test]
    fn success_clears_a_prior_failure() {
        let metric = Arc::new(DecayingQualityMetric::new(0.2));
        metric.clone().start(1024).discard();
        assert_eq!(metric.score(), FAILED_QUALITY);
        metric.clone().start(1024).stop();
        assert!(metric.score() < FAILED_QUALITY);
    }

    #[test]
    fn idle_tick_relaxes_toward_neutral() {
        let metric = Arc::new(DecayingQualityMetric::new(1.0));
        metric.clone().start(1024).stop();
        let after_sample = metric.score();
        metric.idle_tick();
        let after_tick = metric.score();
        assert!((after_tick.0 - NEUTRAL_QUALITY.0).abs() < (after_sample.0 - NEUTRAL_QUALITY.0).abs());
    }

    #[test]
    fn fixed_metric_never_moves_on_its_own() {
        let metric = Arc::new(FixedQualityMetric::new(Quality(500)));
        metric.clone().start(4096).stop();
        assert_eq!(metric.score(), Quality(500));
    }

    #[test]
    fn fixed_metric_failure_is_forced_and_overridable() {
        let metric = Arc::new(FixedQualityMetric::new(Quality(500)));
        metric.clone().start(4096).discard();
        assert_eq!(metric.score(), FAILED_QUALITY);
        metric.set(Quality(500));
        assert_eq!(metric.score(), Quality(500));
    }
}
