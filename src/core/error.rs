use thiserror::Error;

/// Input rules checked once, before any projection year is computed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("retirement age {retirement_age} must be greater than current age {current_age}")]
    RetirementNotAfterCurrentAge {
        current_age: u32,
        retirement_age: u32,
    },
    #[error("projection years must be > 0")]
    EmptyHorizon,
    #[error("{field} must be a finite value, got {value}")]
    NonFinite { field: String, value: f64 },
    #[error("{field} must be >= 0, got {value}")]
    Negative { field: String, value: f64 },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{kind} '{name}' ends at age {end_age} before it starts at age {start_age}")]
    EndBeforeStart {
        kind: &'static str,
        name: String,
        start_age: u32,
        end_age: u32,
    },
    #[error("liability '{name}' must have a term of at least one year")]
    ZeroTerm { name: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("at least {required} samples are required, got {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("computation produced an invalid value: {0}")]
    Computation(String),
    #[error("simulation run cancelled after {completed} of {requested} trajectories")]
    Cancelled { completed: usize, requested: usize },
}

pub(crate) fn ensure_finite(value: f64, what: &str) -> Result<f64, ProjectionError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ProjectionError::Computation(format!(
            "{what} is not finite ({value})"
        )))
    }
}
