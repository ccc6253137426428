//! Transfer rate limiter for network storage.
//!
//! The limiter accumulates transferred octets and elapsed time; once the
//! accumulator is large enough to be statistically meaningful (1 MiB or
//! 100 ms; tiny bursts are not reliable), it computes the delay needed
//! to stay at or below the configured cap, sleeps it off, and records a
//! rate sample in a small sliding window. Sub-sample bursts return
//! immediately.

use std::time::Duration;

use chrono::Timelike;

use crate::error::{Error, Result};

/// Number of rate samples kept in the sliding window.
const MEASUREMENT_COUNT: usize = 8;

/// Accumulate at least this much before computing a sample.
const MIN_SAMPLE_BYTES: u64 = 1024 * 1024;
const MIN_SAMPLE_MICROS: u64 = 100_000;

/// Sleep slice so an abort can preempt a long delay.
const SLEEP_SLICE_MICROS: u64 = 100_000;

/// One timed rate cap: active while the local hour lies in
/// `[begin_hour, end_hour)`. An empty rule list means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthRule {
    pub begin_hour: u8,
    pub end_hour: u8,
    /// Cap in bits per second; 0 disables the cap for this window.
    pub bits_per_second: u64,
}

impl BandwidthRule {
    /// A cap active around the clock.
    pub fn always(bits_per_second: u64) -> Self {
        BandwidthRule { begin_hour: 0, end_hour: 24, bits_per_second }
    }

    fn matches(&self, hour: u8) -> bool {
        if self.begin_hour <= self.end_hour {
            hour >= self.begin_hour && hour < self.end_hour
        } else {
            // Over-midnight window, e.g. 22..6.
            hour >= self.begin_hour || hour < self.end_hour
        }
    }
}

pub struct BandwidthLimiter {
    rules: Vec<BandwidthRule>,
    measurements: [u64; MEASUREMENT_COUNT],
    measurement_count: usize,
    measurement_next_index: usize,
    measurement_bytes: u64,
    measurement_micros: u64,
    block_size: usize,
}

impl BandwidthLimiter {
    pub fn new(rules: Vec<BandwidthRule>) -> Self {
        let mut limiter = BandwidthLimiter {
            rules,
            measurements: [0; MEASUREMENT_COUNT],
            measurement_count: 0,
            measurement_next_index: 0,
            measurement_bytes: 0,
            measurement_micros: 0,
            block_size: 64 * 1024,
        };
        let cap = limiter.current_cap();
        limiter.measurements = [cap; MEASUREMENT_COUNT];
        limiter
    }

    /// Cap in bits per second at this moment; 0 means unlimited.
    pub fn current_cap(&self) -> u64 {
        let hour = chrono::Local::now().hour() as u8;
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(hour))
            .map(|rule| rule.bits_per_second)
            .unwrap_or(0)
    }

    /// Preferred transfer block size for the next burst.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Average of the recorded rate samples in bits per second.
    pub fn average(&self) -> u64 {
        if self.measurement_count == 0 {
            return 0;
        }
        let sum: u64 = self.measurements[..self.measurement_count].iter().sum();
        sum / self.measurement_count as u64
    }

    /// Record one I/O burst and throttle if the accumulated window runs
    /// above the configured cap. `abort` preempts the sleep.
    pub fn limit(
        &mut self,
        transmitted_bytes: u64,
        transmission_micros: u64,
        abort: &dyn Fn() -> bool,
    ) -> Result<()> {
        if self.rules.is_empty() {
            return Ok(());
        }

        self.measurement_bytes += transmitted_bytes;
        self.measurement_micros += transmission_micros;

        // Too-small sizes/times are not reliable, keep accumulating.
        if self.measurement_bytes <= MIN_SAMPLE_BYTES
            && self.measurement_micros <= MIN_SAMPLE_MICROS
        {
            return Ok(());
        }

        let cap = self.current_cap();
        let delay_micros = if cap > 0 {
            let calculated = self
                .measurement_bytes
                .saturating_mul(8)
                .saturating_mul(1_000_000)
                / cap;
            calculated.saturating_sub(self.measurement_micros)
        } else {
            0
        };

        if delay_micros > 0 {
            let mut remaining = delay_micros;
            while remaining > 0 {
                if abort() {
                    return Err(Error::Aborted);
                }
                let slice = remaining.min(SLEEP_SLICE_MICROS);
                std::thread::sleep(Duration::from_micros(slice));
                remaining -= slice;
            }
        }

        // Record the rate actually achieved (delay included).
        let total_micros = self.measurement_micros + delay_micros;
        debug_assert!(total_micros > 0);
        let sample = self
            .measurement_bytes
            .saturating_mul(8)
            .saturating_mul(1_000_000)
            / total_micros.max(1);
        self.measurements[self.measurement_next_index] = sample;
        self.measurement_next_index = (self.measurement_next_index + 1) % MEASUREMENT_COUNT;
        if self.measurement_count < MEASUREMENT_COUNT {
            self.measurement_count += 1;
        }

        self.measurement_bytes = 0;
        self.measurement_micros = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn no_abort() -> bool {
        false
    }

    #[test]
    fn unlimited_never_sleeps() {
        let mut limiter = BandwidthLimiter::new(Vec::new());
        let start = Instant::now();
        for _ in 0..64 {
            limiter.limit(1024 * 1024, 1, &no_abort).unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn small_bursts_do_not_trigger_a_sleep() {
        // 64 Kbit/s cap, but bursts far below the sample threshold.
        let mut limiter = BandwidthLimiter::new(vec![BandwidthRule::always(64_000)]);
        let start = Instant::now();
        for _ in 0..8 {
            limiter.limit(16 * 1024, 10, &no_abort).unwrap();
        }
        // 8 * 16 KiB = 128 KiB < 1 MiB and 80 us < 100 ms: no sample yet.
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn cap_is_enforced_over_the_window() {
        // 64 Mbit/s cap; feed 2 MiB claiming ~0 elapsed time. The
        // required delay is 2 MiB * 8 / 64e6 ~= 262 ms.
        let mut limiter = BandwidthLimiter::new(vec![BandwidthRule::always(64_000_000)]);
        let start = Instant::now();
        limiter.limit(2 * 1024 * 1024, 10, &no_abort).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "slept only {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(700), "slept {:?}", elapsed);
    }

    #[test]
    fn abort_preempts_the_sleep() {
        // Tiny cap so the computed delay is long; abort must cut it off.
        let mut limiter = BandwidthLimiter::new(vec![BandwidthRule::always(8_000)]);
        let start = Instant::now();
        let result = limiter.limit(4 * 1024 * 1024, 10, &|| true);
        assert!(matches!(result, Err(Error::Aborted)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn over_midnight_rule_matches() {
        let rule = BandwidthRule { begin_hour: 22, end_hour: 6, bits_per_second: 1 };
        assert!(rule.matches(23));
        assert!(rule.matches(3));
        assert!(!rule.matches(12));
    }
}
