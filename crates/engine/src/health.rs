//! Stream health monitoring.
//!
//! Two advisory monitors attach to a running encoder's progress events:
//! a stall detector that notices when progress stops arriving, and a
//! rolling bitrate window that flags delivery instability. Neither triggers
//! a retry by itself; instability only enriches the diagnostics attached to
//! failures, while a stall is surfaced to the orchestration loop as a
//! connection-class symptom.

use std::collections::VecDeque;
use tokio::time::Instant;

/// Detects streams that have gone quiet while nominally active.
#[derive(Debug, Clone)]
pub struct StallDetector {
    last_progress: Instant,
    timeout: std::time::Duration,
}

impl StallDetector {
    pub fn new(timeout: std::time::Duration, now: Instant) -> Self {
        Self {
            last_progress: now,
            timeout,
        }
    }

    /// Records a progress event.
    pub fn touch(&mut self, now: Instant) {
        self.last_progress = now;
    }

    /// The instant at which the stream counts as stalled unless progress
    /// arrives first. Suitable for `tokio::time::sleep_until`.
    pub fn deadline(&self) -> Instant {
        self.last_progress + self.timeout
    }

    /// Seconds since the last progress event.
    pub fn silence_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.last_progress).as_secs()
    }

    pub fn is_stalled(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

/// Rolling window of outbound bitrate samples with mean/deviation stats.
#[derive(Debug, Clone)]
pub struct BitrateWindow {
    samples: VecDeque<f32>,
    capacity: usize,
    /// Relative deviation (std dev / mean) above which the stream counts
    /// as unstable.
    instability_ratio: f32,
}

impl BitrateWindow {
    pub fn new(capacity: usize, instability_ratio: f32) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            instability_ratio,
        }
    }

    /// Adds a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, bitrate_kbps: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(bitrate_kbps);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    pub fn std_dev(&self) -> f32 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|s| {
                let d = s - mean;
                d * d
            })
            .sum::<f32>()
            / self.samples.len() as f32;
        variance.sqrt()
    }

    /// Whether the window shows delivery instability. Needs a handful of
    /// samples before it will say anything.
    pub fn is_unstable(&self) -> bool {
        if self.samples.len() < 5 {
            return false;
        }
        let mean = self.mean();
        if mean <= 0.0 {
            return false;
        }
        self.std_dev() / mean > self.instability_ratio
    }

    /// Most recent sample, if any.
    pub fn last(&self) -> Option<f32> {
        self.samples.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // *For any* sample sequence, the window never exceeds its capacity
        // and the mean stays within the sample range.
        #[test]
        fn prop_window_bounded_and_mean_in_range(
            samples in prop::collection::vec(100.0f32..10_000.0, 1..200),
            capacity in 1usize..80,
        ) {
            let mut window = BitrateWindow::new(capacity, 0.3);
            for s in &samples {
                window.push(*s);
            }

            prop_assert!(window.len() <= capacity);

            let tail_start = samples.len().saturating_sub(capacity);
            let tail = &samples[tail_start..];
            let min = tail.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = tail.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mean = window.mean();
            prop_assert!(mean >= min - 0.01 && mean <= max + 0.01);
        }

        // A perfectly steady bitrate is never flagged unstable.
        #[test]
        fn prop_constant_bitrate_is_stable(
            bitrate in 100.0f32..10_000.0,
            count in 5usize..100,
        ) {
            let mut window = BitrateWindow::new(60, 0.3);
            for _ in 0..count {
                window.push(bitrate);
            }
            prop_assert!(!window.is_unstable());
            prop_assert!(window.std_dev() < 0.01 * bitrate.max(1.0));
        }
    }

    #[test]
    fn test_wildly_varying_bitrate_is_unstable() {
        let mut window = BitrateWindow::new(60, 0.3);
        for i in 0..30 {
            window.push(if i % 2 == 0 { 500.0 } else { 4500.0 });
        }
        assert!(window.is_unstable());
    }

    #[test]
    fn test_mild_variation_is_stable() {
        let mut window = BitrateWindow::new(60, 0.3);
        for i in 0..30 {
            window.push(2500.0 + (i % 5) as f32 * 20.0);
        }
        assert!(!window.is_unstable());
    }

    #[test]
    fn test_too_few_samples_never_unstable() {
        let mut window = BitrateWindow::new(60, 0.3);
        window.push(100.0);
        window.push(9000.0);
        assert!(!window.is_unstable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_detector_deadline() {
        let start = Instant::now();
        let mut detector = StallDetector::new(Duration::from_secs(30), start);

        assert!(!detector.is_stalled(start));
        assert_eq!(detector.deadline(), start + Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(20)).await;
        let now = Instant::now();
        assert!(!detector.is_stalled(now));

        // A progress event pushes the deadline out.
        detector.touch(now);
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!detector.is_stalled(Instant::now()));

        tokio::time::advance(Duration::from_secs(6)).await;
        let now = Instant::now();
        assert!(detector.is_stalled(now));
        assert!(detector.silence_secs(now) >= 30);
    }
}
