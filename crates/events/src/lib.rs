//! Event records and the JSON-lines protocol shared by the multiplexer,
//! the overseer and supervised programs.
//!
//! Supervised programs write one JSON object per line to the data channel
//! whose descriptor is advertised in [`DATA_FD_ENV`]. Objects carrying the
//! reserved [`EVENT_KEY`] are tagged events; anything else is plain data.

mod channel;
mod error;
mod protocol;
mod types;
mod writer;

pub use channel::{DataChannel, DATA_FD_ENV, UNBUFFERED_ENV};
pub use error::{EventsError, Result};
pub use protocol::{decode_line, Decoded, LineDecoder, DATA_KEY, EVENT_KEY};
pub use types::*;
pub use writer::{encode_line, JsonlWriter, LogTarget, UNREPRESENTABLE, UNSERIALIZABLE};
