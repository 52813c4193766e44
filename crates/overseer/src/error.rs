use overwatch_core::{CoreError, PhaseFailure};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverseerError {
    #[error("Phase {phase} failed: {failure}")]
    Phase {
        phase: &'static str,
        failure: PhaseFailure,
    },

    #[error("Overseer was already run")]
    AlreadyRan,

    #[error("Overseer is no longer alive")]
    Detached,

    #[error("Arguments were already parsed")]
    ArgumentsParsed,

    #[error("No script to run: SCRIPT must be given")]
    MissingScript,

    #[error("Invalid config file {path}: {message}")]
    Config { path: String, message: String },

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Events(#[from] events::EventsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverseerError {
    /// The failure of the supervised program or of an overseer phase, if
    /// this is one.
    pub fn failure(&self) -> Option<&PhaseFailure> {
        match self {
            Self::Phase { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OverseerError>;

/// Raised by a program (or an instrument) to end the run early.
///
/// The run then finishes normally: no `error` event is logged and
/// `finalize` still runs.
#[derive(Debug, Error, Default, Clone, Copy)]
#[error("Program stopped")]
pub struct StopProgram;

/// A program that exited with a non-zero status.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Program exited with status {code}")]
pub struct ProgramExit {
    pub code: i32,
}

/// Short type name of an error, as reported in log records.
pub fn error_type(error: &anyhow::Error) -> &'static str {
    if let Some(failure) = error.downcast_ref::<PhaseFailure>() {
        return error_type(failure.error());
    }
    if error.downcast_ref::<StopProgram>().is_some() {
        "StopProgram"
    } else if error.downcast_ref::<ProgramExit>().is_some() {
        "ProgramExit"
    } else if error.downcast_ref::<clap::Error>().is_some() {
        "ArgumentError"
    } else if error.downcast_ref::<OverseerError>().is_some() {
        "OverseerError"
    } else if error.downcast_ref::<CoreError>().is_some() {
        "SchedulingError"
    } else if error.downcast_ref::<std::io::Error>().is_some() {
        "IOError"
    } else {
        "Error"
    }
}
