//! Process I/O multiplexer.
//!
//! A [`Multiplexer`] supervises child processes and merges their output
//! streams (stdout, stderr and the structured data channel) into a single
//! ordered sequence of [`events::Event`]s, ending each process with an
//! `end` event carrying its return code.

mod error;
mod multiplexer;
mod pipe;
mod process;
mod stream;

pub use error::{MultiplexerError, Result};
pub use multiplexer::{Multiplexer, ProcessId, Tick};
pub use process::SpawnOptions;
pub use stream::Stream;
