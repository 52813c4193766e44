use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use serde_json::json;

use crate::error::{EventsError, Result};

/// Marker used when a payload cannot be serialized
pub const UNSERIALIZABLE: &str = "$unserializable";
/// Marker used when a payload cannot even be formatted
pub const UNREPRESENTABLE: &str = "$unrepresentable";

/// Where JSON lines are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Path(PathBuf),
    /// An inherited descriptor; 1 and 2 map to stdout and stderr
    Fd(RawFd),
}

impl FromStr for LogTarget {
    type Err = std::convert::Infallible;

    /// All-digit strings are descriptors, anything else is a path.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.parse::<RawFd>() {
            Ok(fd) if fd >= 0 => Ok(Self::Fd(fd)),
            _ => Ok(Self::Path(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Fd(fd) => write!(f, "fd {fd}"),
        }
    }
}

/// Serialize `data` as one JSON line (without the newline).
///
/// Payloads that cannot be serialized degrade to
/// `{"$unserializable": "<debug repr>"}`, and to `{"$unrepresentable": null}`
/// if they cannot be formatted either.
pub fn encode_line<T>(data: &T) -> String
where
    T: Serialize + fmt::Debug + ?Sized,
{
    match serde_json::to_string(data) {
        Ok(text) => text,
        Err(error) => {
            tracing::debug!(%error, "Payload is not serializable");
            let mut repr = String::new();
            match write!(repr, "{data:?}") {
                Ok(()) => json!({ UNSERIALIZABLE: repr }).to_string(),
                Err(_) => json!({ UNREPRESENTABLE: null }).to_string(),
            }
        }
    }
}

/// Line-oriented JSON writer. Writing never fails; I/O errors are traced and
/// the line is dropped.
pub struct JsonlWriter {
    out: Box<dyn Write + Send>,
    target: String,
}

impl JsonlWriter {
    /// Open `target` for writing.
    ///
    /// When `require_writable` is false, a target that cannot be opened
    /// degrades to a writer that discards everything.
    pub fn open(target: &LogTarget, require_writable: bool) -> Result<Self> {
        match Self::try_open(target) {
            Ok(out) => Ok(Self {
                out,
                target: target.to_string(),
            }),
            Err(error) if !require_writable => {
                tracing::warn!(%target, %error, "Log target not writable, discarding log");
                Ok(Self::sink())
            }
            Err(error) => Err(error),
        }
    }

    fn try_open(target: &LogTarget) -> Result<Box<dyn Write + Send>> {
        match target {
            LogTarget::Fd(1) => Ok(Box::new(io::stdout())),
            LogTarget::Fd(2) => Ok(Box::new(io::stderr())),
            LogTarget::Fd(fd) => {
                if !is_writable_fd(*fd) {
                    return Err(EventsError::InvalidDescriptor(*fd));
                }
                // SAFETY: the descriptor is open, and it is handed to us by the
                // parent process for our exclusive use.
                let file = unsafe { File::from_raw_fd(*fd) };
                Ok(Box::new(file))
            }
            LogTarget::Path(path) => {
                let file = File::create(path).map_err(|source| EventsError::Open {
                    target: target.to_string(),
                    source,
                })?;
                Ok(Box::new(file))
            }
        }
    }

    /// A writer that discards everything
    pub fn sink() -> Self {
        Self {
            out: Box::new(io::sink()),
            target: "sink".to_string(),
        }
    }

    pub fn from_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            target: "writer".to_string(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log<T>(&mut self, data: &T)
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        let mut line = encode_line(data);
        line.push('\n');
        if let Err(error) = self
            .out
            .write_all(line.as_bytes())
            .and_then(|()| self.out.flush())
        {
            tracing::warn!(target = %self.target, %error, "Failed to write log line");
        }
    }

    pub fn flush(&mut self) {
        if let Err(error) = self.out.flush() {
            tracing::warn!(target = %self.target, %error, "Failed to flush log");
        }
    }
}

impl fmt::Debug for JsonlWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlWriter")
            .field("target", &self.target)
            .finish()
    }
}

fn is_writable_fd(fd: RawFd) -> bool {
    // SAFETY: F_GETFL only queries descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    flags >= 0 && (flags & libc::O_ACCMODE) != libc::O_RDONLY
}
