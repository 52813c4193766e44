//! Phase scheduling primitives.
//!
//! A [`PhaseRunner`] owns a fixed, ordered set of [`Phase`]s and drives
//! handler coroutines that suspend on them. Handlers are plain Rust futures
//! that await [`Phase::wait`] or [`Phase::at`]; the runner polls them on the
//! calling thread, so no executor is involved.

pub mod error;
pub mod handler;
pub mod phase;
pub mod runner;
pub mod state_machine;
pub mod status;

pub use error::{CoreError, Result};
pub use handler::{coroutine, eager, Coroutine, Handler, Invocation};
pub use phase::{Phase, PhaseFailure, PhaseRequest, Wait};
pub use runner::{ErrorHandler, PhaseRunner, RevisitPolicy, START};
pub use state_machine::PhaseStateMachine;
pub use status::PhaseStatus;
