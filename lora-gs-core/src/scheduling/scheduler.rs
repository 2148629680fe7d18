use crate::clock::Clock;
use chrono::{DateTime, Utc};
use lora_gs_error::SchedulingError;
use lora_gs_models::{FrequencyPlan, SubBand, SubBandStats};
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// Window over which duty cycle is accounted.
pub const DUTY_CYCLE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// A scheduled transmission occupying the radio from `start` for `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub start: DateTime<Utc>,
    pub duration: Duration,
}

impl Emission {
    #[inline]
    pub fn end(&self) -> DateTime<Utc> {
        self.start + to_chrono(self.duration)
    }

    #[inline]
    fn overlaps(&self, other: &Emission) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

#[inline]
fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Downlink transmission to admit.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleRequest {
    /// Absolute start; `None` lets the scheduler pick the earliest slot.
    pub time: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub frequency: u64,
}

#[derive(Debug)]
struct SubBandState {
    band: SubBand,
    emissions: VecDeque<Emission>,
}

impl SubBandState {
    /// Airtime spent in the window ending at `until`.
    fn usage(&self, until: DateTime<Utc>) -> Duration {
        let from = until - to_chrono(DUTY_CYCLE_WINDOW);
        self.emissions
            .iter()
            .filter(|e| e.end() > from && e.start < until)
            .map(|e| e.duration)
            .sum()
    }
}

/// Per-gateway admission of downlink emissions.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    sub_bands: Vec<SubBandState>,
    emissions: Vec<Emission>,
    enforce_duty_cycle: bool,
    schedule_anytime_delay: Duration,
}

impl Scheduler {
    /// Scheduler accounting duty cycle over the sub-bands of `plans`.
    ///
    /// # Arguments
    /// * `clock` - Time source for "now" and the duty-cycle window
    /// * `plans` - Frequency plans whose sub-bands bound the frequencies accepted
    /// * `enforce_duty_cycle` - Whether sub-band duty-cycle limits are checked
    /// * `schedule_anytime_delay` - Lead time for downlinks without absolute time
    pub fn new(
        clock: Arc<dyn Clock>,
        plans: &[FrequencyPlan],
        enforce_duty_cycle: bool,
        schedule_anytime_delay: Duration,
    ) -> Self {
        let mut sub_bands: Vec<SubBandState> = Vec::new();
        for band in plans.iter().flat_map(|p| p.sub_bands.iter()) {
            if sub_bands.iter().any(|s| s.band == *band) {
                continue;
            }
            sub_bands.push(SubBandState {
                band: band.clone(),
                emissions: VecDeque::new(),
            });
        }
        Self {
            clock,
            sub_bands,
            emissions: Vec::new(),
            enforce_duty_cycle,
            schedule_anytime_delay,
        }
    }

    fn gc(&mut self, now: DateTime<Utc>) {
        let horizon = now - to_chrono(DUTY_CYCLE_WINDOW);
        self.emissions.retain(|e| e.end() > horizon);
        for sb in &mut self.sub_bands {
            while sb.emissions.front().is_some_and(|e| e.end() <= horizon) {
                sb.emissions.pop_front();
            }
        }
    }

    fn first_conflict(&self, candidate: &Emission) -> Option<&Emission> {
        self.emissions.iter().find(|e| e.overlaps(candidate))
    }

    /// Admits the emission or reports why it cannot be scheduled.
    pub fn schedule(&mut self, req: ScheduleRequest) -> Result<Emission, SchedulingError> {
        let now = self.clock.now();
        self.gc(now);

        let band_idx = self
            .sub_bands
            .iter()
            .position(|s| s.band.contains(req.frequency))
            .ok_or(SchedulingError::NoSubBand {
                frequency: req.frequency,
            })?;

        let emission = match req.time {
            Some(start) => {
                if start < now {
                    return Err(SchedulingError::TooLate {
                        start: start.to_rfc3339(),
                    });
                }
                let emission = Emission {
                    start,
                    duration: req.duration,
                };
                if let Some(conflict) = self.first_conflict(&emission) {
                    return Err(SchedulingError::Conflict {
                        conflicting_start: conflict.start.to_rfc3339(),
                    });
                }
                emission
            }
            None => {
                let mut emission = Emission {
                    start: now + to_chrono(self.schedule_anytime_delay),
                    duration: req.duration,
                };
                while let Some(conflict) = self.first_conflict(&emission) {
                    emission.start = conflict.end();
                }
                emission
            }
        };

        let sb = &mut self.sub_bands[band_idx];
        if self.enforce_duty_cycle {
            let used = sb.usage(emission.end()) + emission.duration;
            let limit = DUTY_CYCLE_WINDOW.mul_f64(f64::from(sb.band.duty_cycle));
            if used > limit {
                return Err(SchedulingError::DutyCycle {
                    frequency: req.frequency,
                });
            }
        }

        let pos = sb
            .emissions
            .iter()
            .position(|e| e.start > emission.start)
            .unwrap_or(sb.emissions.len());
        sb.emissions.insert(pos, emission);
        let pos = self
            .emissions
            .iter()
            .position(|e| e.start > emission.start)
            .unwrap_or(self.emissions.len());
        self.emissions.insert(pos, emission);
        Ok(emission)
    }

    /// Utilization of every sub-band over the last window.
    pub fn sub_band_stats(&self) -> Vec<SubBandStats> {
        let now = self.clock.now();
        self.sub_bands
            .iter()
            .map(|sb| SubBandStats {
                min_frequency: sb.band.min_frequency,
                max_frequency: sb.band.max_frequency,
                downlink_utilization_limit: sb.band.duty_cycle,
                downlink_utilization: (sb.usage(now).as_secs_f64()
                    / DUTY_CYCLE_WINDOW.as_secs_f64()) as f32,
            })
            .collect()
    }
}
