//! Adaptive batch sizing
//!
//! [`BatchSizeTuner`] is a proportional feedback controller. It averages the
//! durations of the last `buffer_size` rounds and, when the mean falls outside
//! `[min_time, max_time]`, scales the batch size by the relative distance to
//! the nearest bound. Each adjustment clears the buffer so that rounds timed at
//! the old size never drive a second adjustment.
//!
//! When `min_size == max_size` the tuner is fixed and ignores all timings.

use crate::error::ConfigError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tuner parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerSettings {
    /// Batch size before any adjustment
    pub initial_size: usize,

    /// Number of round durations averaged per decision
    pub buffer_size: usize,

    /// Smallest batch size
    pub min_size: usize,

    /// Largest batch size
    pub max_size: usize,

    /// Rounds faster than this grow the batch
    pub min_time: Duration,

    /// Rounds slower than this shrink the batch
    pub max_time: Duration,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            initial_size: 50,
            buffer_size: 10,
            min_size: 25,
            max_size: 250,
            min_time: Duration::from_secs(5),
            max_time: Duration::from_secs(20),
        }
    }
}

impl TunerSettings {
    /// Replace the size bounds (a processor's declared bounds)
    pub fn with_size_bounds(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Replace the target time window
    pub fn with_time_bounds(mut self, min_time: Duration, max_time: Duration) -> Self {
        self.min_time = min_time;
        self.max_time = max_time;
        self
    }

    /// Check the bounds are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(ConfigError::InvalidBatchSize {
                min: self.min_size,
                max: self.max_size,
            });
        }
        if self.min_time > self.max_time {
            return Err(ConfigError::InvalidBatchTime {
                min: self.min_time.as_secs_f64(),
                max: self.max_time.as_secs_f64(),
            });
        }
        Ok(())
    }
}

/// Picks the number of keys to fetch per round
#[derive(Debug, Clone)]
pub struct BatchSizeTuner {
    settings: TunerSettings,
    current: usize,
    durations: VecDeque<Duration>,
    last_tick: Option<Instant>,
}

impl BatchSizeTuner {
    /// Create a tuner; the initial size is clamped into the size bounds
    pub fn new(settings: TunerSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let current = if settings.min_size == settings.max_size {
            info!(batch_size = settings.min_size, "Batch size fixed");
            settings.min_size
        } else {
            debug!(
                min = settings.min_size,
                max = settings.max_size,
                "Batch size range set"
            );
            settings.initial_size.clamp(settings.min_size, settings.max_size)
        };

        Ok(Self {
            settings,
            current,
            durations: VecDeque::with_capacity(settings.buffer_size + 1),
            last_tick: None,
        })
    }

    /// Whether adaptation is disabled
    pub fn is_fixed(&self) -> bool {
        self.settings.min_size == self.settings.max_size
    }

    /// Current batch size
    pub fn batch_size(&self) -> usize {
        self.current
    }

    /// Settings in use
    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Mark the start of a round and return the size to fetch.
    ///
    /// The time since the previous call is recorded as the previous round's
    /// duration. The first call after construction, a reset or a size change
    /// records nothing.
    pub fn next_batch(&mut self) -> usize {
        if self.is_fixed() {
            return self.current;
        }

        let now = Instant::now();
        match self.last_tick.take() {
            Some(last) => {
                if !self.record(now.duration_since(last)) {
                    self.last_tick = Some(now);
                }
            }
            None => self.last_tick = Some(now),
        }

        self.current
    }

    /// Record one round's duration; returns true when the batch size changed
    pub fn record(&mut self, duration: Duration) -> bool {
        if self.is_fixed() {
            return false;
        }

        self.durations.push_back(duration);
        if self.durations.len() < self.settings.buffer_size {
            return false;
        }
        while self.durations.len() > self.settings.buffer_size {
            self.durations.pop_front();
        }

        let mean = self.durations.iter().map(Duration::as_secs_f64).sum::<f64>()
            / self.durations.len() as f64;
        let new_size = self.size_for_mean(mean);

        if new_size != self.current {
            info!(
                mean_secs = format!("{:.2}", mean),
                from = self.current,
                to = new_size,
                "Changing batch size"
            );
            self.current = new_size;
            self.reset();
            true
        } else {
            debug!(mean_secs = mean, batch_size = self.current, "Batch size unchanged");
            false
        }
    }

    /// Forget all timings (start of a new range)
    pub fn reset(&mut self) {
        self.durations.clear();
        self.last_tick = None;
    }

    fn size_for_mean(&self, mean: f64) -> usize {
        let min_time = self.settings.min_time.as_secs_f64();
        let max_time = self.settings.max_time.as_secs_f64();
        let current = self.current as f64;

        if mean <= 0.0 {
            return self.settings.max_size;
        }

        if mean < min_time {
            let proportion = (min_time - mean) / mean;
            let grown = (current + current * proportion).round() as usize;
            grown.min(self.settings.max_size)
        } else if mean > max_time {
            let proportion = (mean - max_time) / mean;
            let shrunk = (current - current * proportion).round() as usize;
            shrunk.max(self.settings.min_size)
        } else {
            self.current
        }
    }
}
