use std::time::{Duration, Instant};

/// Default sliding window for speed estimation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default cap on retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Upload speed over a sliding time window.
///
/// Each sample is the number of bytes sent since the previous one.
pub struct SpeedCalculator {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// `None` picks the defaults: a 5 s window and at most 100 samples.
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
            window_size: window_size.unwrap_or(DEFAULT_WINDOW),
        }
    }

    /// Records `bytes` sent at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    /// Records `bytes` sent at `timestamp`.
    pub fn add_sample_at(&mut self, bytes: u64, timestamp: Instant) {
        self.samples.push(SpeedSample { bytes, timestamp });

        if let Some(cutoff) = timestamp.checked_sub(self.window_size) {
            self.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    /// Average bytes per second across the retained samples, or 0.0 until
    /// two samples span a non-zero interval.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample marks the window start; its bytes predate it.
        let total_bytes: u64 = self.samples[1..].iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining_bytes as f64 / speed).ok()
    }

    /// Clears all recorded samples (after a restart rewinds the job).
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn single_sample() {
        let mut calc = SpeedCalculator::default();
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn steady_rate() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(1000, t0 + Duration::from_secs(1));
        calc.add_sample_at(1000, t0 + Duration::from_secs(2));

        assert!((calc.bytes_per_second() - 1000.0).abs() < 1e-6);
        let eta = calc.eta(5000).unwrap();
        assert!((eta.as_secs_f64() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(2)), None);
        let t0 = Instant::now();
        calc.add_sample_at(1_000_000, t0);
        calc.add_sample_at(10, t0 + Duration::from_secs(10));
        calc.add_sample_at(10, t0 + Duration::from_secs(11));
        assert!((calc.bytes_per_second() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn max_samples() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.samples.len() <= 5);
    }

    #[test]
    fn reset_clears_samples() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample_at(100, t0);
        calc.add_sample_at(200, t0 + Duration::from_millis(50));
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }
}
