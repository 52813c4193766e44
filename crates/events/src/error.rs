use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("Cannot open log target {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File descriptor {0} is not open for writing")]
    InvalidDescriptor(i32),

    #[error("Invalid data channel descriptor: {0:?}")]
    InvalidChannel(String),
}

pub type Result<T> = std::result::Result<T, EventsError>;
