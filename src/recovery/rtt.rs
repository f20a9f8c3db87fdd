//! RTT estimation (RFC 9002 Section 5).

#![forbid(unsafe_code)]

use crate::types::{GRANULARITY, INITIAL_RTT};
use core::time::Duration;

/// Smoothed RTT and variance via exponentially weighted moving averages.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed_rtt: Duration,
    rtt_var: Duration,
    min_rtt: Duration,
    latest_rtt: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(INITIAL_RTT)
    }
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            smoothed_rtt: initial_rtt,
            rtt_var: initial_rtt / 2,
            min_rtt: initial_rtt,
            latest_rtt: initial_rtt,
            has_sample: false,
        }
    }

    /// Feed one RTT sample (RFC 9002 Section 5.3).
    ///
    /// `ack_delay` is the peer-reported delay, already clamped to its
    /// max_ack_delay by the caller. The sample is only adjusted by it when
    /// the result would not dip under `min_rtt`.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest_rtt = sample;

        if !self.has_sample {
            self.has_sample = true;
            self.min_rtt = sample;
            self.smoothed_rtt = sample;
            self.rtt_var = sample / 2;
            return;
        }

        self.min_rtt = self.min_rtt.min(sample);

        let adjusted = if sample.saturating_sub(ack_delay) >= self.min_rtt {
            sample - ack_delay
        } else {
            sample
        };

        let var_sample = if self.smoothed_rtt > adjusted {
            self.smoothed_rtt - adjusted
        } else {
            adjusted - self.smoothed_rtt
        };
        self.rtt_var = (self.rtt_var * 3 + var_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted) / 8;
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn rtt_var(&self) -> Duration {
        self.rtt_var
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Base PTO without backoff: `srtt + max(4*rttvar, kGranularity)`.
    /// The caller adds max_ack_delay for the Application space.
    pub fn pto_base(&self) -> Duration {
        self.smoothed_rtt + (self.rtt_var * 4).max(GRANULARITY)
    }

    /// Loss time threshold: `9/8 * max(srtt, latest_rtt)`.
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed_rtt.max(self.latest_rtt);
        (base * crate::types::TIME_THRESHOLD_NUM / crate::types::TIME_THRESHOLD_DEN)
            .max(GRANULARITY)
    }

    /// Reset estimator state after persistent congestion
    /// (RFC 9002 Section 7.6.2).
    pub fn reset(&mut self) {
        *self = Self::new(INITIAL_RTT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_initializes() {
        let mut rtt = RttEstimator::default();
        assert!(!rtt.has_sample());

        rtt.update(Duration::from_millis(100), Duration::from_millis(50));
        assert!(rtt.has_sample());
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.rtt_var(), Duration::from_millis(50));
        assert_eq!(rtt.min_rtt(), Duration::from_millis(100));
    }

    #[test]
    fn test_ewma_smoothing() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(300), Duration::ZERO);

        // srtt = 7/8*100 + 1/8*300 = 125ms
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(125));
        // rttvar = 3/4*50 + 1/4*|100-300| = 87.5ms
        assert_eq!(rtt.rtt_var(), Duration::from_micros(87_500));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(300));
        assert_eq!(rtt.min_rtt(), Duration::from_millis(100));
    }

    #[test]
    fn test_ack_delay_adjustment() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);

        // 150ms sample with 20ms ack delay: adjusted to 130ms since
        // 130 >= min_rtt.
        rtt.update(Duration::from_millis(150), Duration::from_millis(20));
        // srtt = 7/8*100 + 1/8*130 = 103.75ms
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(103_750));

        // A sample where subtracting the delay would undershoot min_rtt is
        // used unadjusted.
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(105), Duration::from_millis(50));
        // adjusted would be 55 < min_rtt(100), so the raw 105 is used:
        // srtt = 7/8*100 + 1/8*105 = 100.625ms
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(100_625));
    }

    #[test]
    fn test_pto_base_floor() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_micros(200), Duration::ZERO);
        rtt.update(Duration::from_micros(200), Duration::ZERO);
        // 4 * rttvar shrinks below 1ms; granularity keeps the floor.
        assert!(rtt.pto_base() >= Duration::from_millis(1));
    }

    #[test]
    fn test_loss_delay_is_nine_eighths() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(80), Duration::ZERO);
        rtt.update(Duration::from_millis(80), Duration::ZERO);
        assert_eq!(rtt.loss_delay(), Duration::from_millis(90));
    }
}
