use thiserror::Error;

/// A zone schedule entry that cannot be evaluated. Skips that zone for the
/// current tick; never aborts the control loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ScheduleError {
    #[error("unrecognized day code '{0}' (expected Mon..Sun)")]
    InvalidDay(String),

    #[error("unparseable start time '{0}' (expected HH:MM)")]
    InvalidTime(String),
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum SensorError {
    #[error("no stable tank reading: {valid} of {wanted} samples in band after {attempts} attempts")]
    Unstable {
        valid: usize,
        wanted: usize,
        attempts: usize,
    },
}
