use thiserror::Error;

#[derive(Error, Debug)]
pub enum MultiplexerError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up data channel: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("Child has no {0} handle")]
    MissingStream(&'static str),
}

pub type Result<T> = std::result::Result<T, MultiplexerError>;
