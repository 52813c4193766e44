use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid phase status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Duplicate phase name: {0}")]
    DuplicatePhase(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Handler must yield a valid phase")]
    InvalidPhaseRequest,
}

pub type Result<T> = std::result::Result<T, CoreError>;
