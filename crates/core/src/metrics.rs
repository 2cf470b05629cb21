//! Frame timing
//!
//! A short rolling window of frame durations. Used to notice stalls in the
//! stereo pipeline, not for profiling.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

/// Frames kept in the rolling window
pub const METRICS_WINDOW: usize = 120;

/// Consecutive over-budget frames that count as a stall
pub const STALL_FRAMES: u32 = 30;

#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    budget: Duration,
    samples: VecDeque<Duration>,
    frames: u64,
    skipped: u64,
    over_budget: u64,
    consecutive_over: u32,
}

impl PerformanceMetrics {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            samples: VecDeque::with_capacity(METRICS_WINDOW),
            frames: 0,
            skipped: 0,
            over_budget: 0,
            consecutive_over: 0,
        }
    }

    /// Budget from milliseconds, as written in config
    pub fn with_budget_ms(ms: f32) -> Self {
        Self::new(Duration::from_secs_f32(ms.max(0.0) / 1000.0))
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Record one processed frame; returns true if it was within budget
    pub fn record(&mut self, elapsed: Duration) -> bool {
        if self.samples.len() == METRICS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
        self.frames += 1;

        if elapsed <= self.budget {
            self.consecutive_over = 0;
            return true;
        }

        self.over_budget += 1;
        self.consecutive_over += 1;
        warn!(
            target: "vrshim::metrics",
            "Stereo frame took {:.2}ms (budget {:.2}ms)",
            elapsed.as_secs_f64() * 1000.0,
            self.budget.as_secs_f64() * 1000.0
        );
        if self.consecutive_over == STALL_FRAMES {
            warn!(
                target: "vrshim::metrics",
                "Stereo pipeline stalled: {} consecutive frames over budget",
                STALL_FRAMES
            );
        }
        false
    }

    /// Count a frame on which stereo processing was skipped
    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    pub fn is_stalled(&self) -> bool {
        self.consecutive_over >= STALL_FRAMES
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn over_budget(&self) -> u64 {
        self.over_budget
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.budget);
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::with_budget_ms(11.1)
    }
}
