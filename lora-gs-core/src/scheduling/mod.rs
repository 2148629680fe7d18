//! Downlink scheduling gate: airtime computation and per-gateway admission.

pub mod airtime;
mod scheduler;

pub use scheduler::{Emission, ScheduleRequest, Scheduler, DUTY_CYCLE_WINDOW};
