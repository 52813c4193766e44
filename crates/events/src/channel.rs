use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{EventsError, Result};
use crate::protocol::{DATA_KEY, EVENT_KEY};
use crate::writer::{JsonlWriter, LogTarget};

/// Environment variable holding the data channel's descriptor
pub const DATA_FD_ENV: &str = "DATA_FD";
/// Environment variable asking interpreters for unbuffered output
pub const UNBUFFERED_ENV: &str = "PYTHONUNBUFFERED";

/// Writing end of the data channel, as seen by a supervised program.
#[derive(Debug)]
pub struct DataChannel {
    writer: JsonlWriter,
}

impl DataChannel {
    /// Descriptor advertised by the supervisor, if any.
    pub fn target_from_env() -> Result<Option<LogTarget>> {
        match std::env::var(DATA_FD_ENV) {
            Ok(raw) => Self::parse_target(&raw).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn parse_target(raw: &str) -> Result<LogTarget> {
        raw.trim()
            .parse::<i32>()
            .ok()
            .filter(|fd| *fd >= 0)
            .map(LogTarget::Fd)
            .ok_or_else(|| EventsError::InvalidChannel(raw.to_string()))
    }

    /// Open the channel advertised in `DATA_FD`. Returns `None` when the
    /// program is not supervised.
    pub fn from_env() -> Result<Option<Self>> {
        match Self::target_from_env()? {
            Some(target) => Ok(Some(Self {
                writer: JsonlWriter::open(&target, true)?,
            })),
            None => Ok(None),
        }
    }

    pub fn from_writer(writer: JsonlWriter) -> Self {
        Self { writer }
    }

    /// Send a plain data record
    pub fn give<T>(&mut self, data: &T)
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        self.writer.log(data);
    }

    /// Send a tagged record named `event`
    pub fn event(&mut self, event: &str, data: Value) {
        self.writer.log(&json!({ EVENT_KEY: event, DATA_KEY: data }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_line, LineDecoder};
    use crate::types::EventKind;

    #[test]
    fn test_parse_target() {
        assert_eq!(DataChannel::parse_target("7").unwrap(), LogTarget::Fd(7));
        assert!(matches!(
            DataChannel::parse_target("seven"),
            Err(EventsError::InvalidChannel(_))
        ));
        assert!(DataChannel::parse_target("-1").is_err());
    }

    #[test]
    fn test_event_is_decodable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let writer = JsonlWriter::open(&LogTarget::Path(path.clone()), true).unwrap();
        let mut channel = DataChannel::from_writer(writer);
        channel.event("rate", json!(4.5));
        channel.give(&json!({"step": 1}));
        drop(channel);

        let text = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<EventKind> = text
            .split_inclusive('\n')
            .map(|line| decode_line(line.as_bytes(), LineDecoder::Json).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Tagged {
                    event: "rate".to_string(),
                    data: json!(4.5),
                },
                EventKind::Data(json!({"step": 1})),
            ]
        );
    }

    #[test]
    fn test_from_env() {
        use std::io::Read;
        use std::os::fd::FromRawFd;

        std::env::remove_var(DATA_FD_ENV);
        assert!(DataChannel::from_env().unwrap().is_none());

        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) fills in.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [reader, writer] = fds;

        std::env::set_var(DATA_FD_ENV, writer.to_string());
        let channel = DataChannel::from_env();
        std::env::remove_var(DATA_FD_ENV);

        let mut channel = channel.unwrap().unwrap();
        channel.give(&json!({"loss": 0.5}));
        channel.event("epoch", json!(2));
        drop(channel);

        // SAFETY: `reader` came from pipe(2) above and is owned by this test.
        let mut reader = unsafe { std::fs::File::from_raw_fd(reader) };
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();

        let kinds: Vec<EventKind> = text
            .split_inclusive('\n')
            .map(|line| decode_line(line.as_bytes(), LineDecoder::Json).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Data(json!({"loss": 0.5})),
                EventKind::Tagged {
                    event: "epoch".to_string(),
                    data: json!(2),
                },
            ]
        );
    }
}
