use crate::ErrorKind;
use thiserror::Error;

/// Downlink admission failures raised by the per-gateway scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// The requested span overlaps an already admitted emission.
    #[error("scheduling conflict with emission starting at {conflicting_start}")]
    Conflict { conflicting_start: String },
    /// Admitting the emission would exceed the sub-band duty cycle.
    #[error("duty cycle limit reached for frequency {frequency} Hz")]
    DutyCycle { frequency: u64 },
    /// No sub-band of the frequency plans covers the frequency.
    #[error("no sub-band for frequency {frequency} Hz")]
    NoSubBand { frequency: u64 },
    /// The absolute start time has already passed.
    #[error("too late to schedule at {start}")]
    TooLate { start: String },
}

impl SchedulingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulingError::Conflict { .. } => ErrorKind::AlreadyExists,
            SchedulingError::DutyCycle { .. } => ErrorKind::ResourceExhausted,
            SchedulingError::NoSubBand { .. } => ErrorKind::InvalidArgument,
            SchedulingError::TooLate { .. } => ErrorKind::FailedPrecondition,
        }
    }
}
