//! Runs a program through a fixed sequence of phases while instruments
//! observe and extend each of them.
//!
//! Instruments are [`overwatch_core::Handler`]s over the [`Ov`] context.
//! They typically wait on `init` to register command-line arguments, read
//! the parsed options after `parse_args`, and report what they measure with
//! [`Ov::give`] and [`Ov::log`].

mod config;
pub mod error;
pub mod instruments;
pub mod overseer;
pub mod resolver;
pub mod tools;
pub mod value;

pub use error::{error_type, OverseerError, ProgramExit, Result, StopProgram};
pub use instruments::walltime;
pub use overseer::{Ov, Overseer, OverseerOptions, Phases, RunOutcome, PHASE_NAMES};
pub use resolver::{CommandResolver, EntryPoint, Executable, ScriptResolver};
pub use tools::{gated, parametrized};
pub use value::{LoadedScript, PhaseValue};
