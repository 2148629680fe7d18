use lora_gs_models::RoundTripTimes;
use std::{collections::VecDeque, time::Duration};

const MAX_SAMPLES: usize = 20;

/// Sliding window over the most recent round-trip samples.
#[derive(Debug, Default)]
pub(crate) struct RttWindow {
    samples: VecDeque<Duration>,
}

impl RttWindow {
    pub(crate) fn record(&mut self, d: Duration) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(d);
    }

    pub(crate) fn stats(&self) -> Option<RoundTripTimes> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2
        };
        Some(RoundTripTimes {
            min: sorted[0],
            max: sorted[n - 1],
            median,
            count: n as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_samples() {
        let mut w = RttWindow::default();
        assert!(w.stats().is_none());
        for ms in 1..=25u64 {
            w.record(Duration::from_millis(ms));
        }
        let s = w.stats().unwrap();
        assert_eq!(s.count, 20);
        assert_eq!(s.min, Duration::from_millis(6));
        assert_eq!(s.max, Duration::from_millis(25));
        assert_eq!(s.median, Duration::from_micros(15_500));
    }
}
