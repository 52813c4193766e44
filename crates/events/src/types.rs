//! Event records produced while multiplexing a supervised process

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use chrono::Utc;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

/// Payload of an [`Event`]
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// The process was started
    Start { time: f64 },
    /// A line of text from an undecoded stream, newline included
    Line(String),
    /// A plain JSON object from the data channel
    Data(Value),
    /// A tagged record from the data channel (`{"$event": name, "$data": ...}`)
    Tagged { event: String, data: Value },
    /// A data channel line that could not be decoded
    FormatError {
        line: String,
        error: String,
        message: String,
    },
    /// A line that is not valid UTF-8
    Binary(Vec<u8>),
    /// The process exited
    End { time: f64, return_code: i32 },
}

/// One entry of the multiplexed event sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Label of the stream the event came from; lifecycle events have none
    pub pipe: Option<String>,
    /// Extra keys of a tagged record
    pub meta: Map<String, Value>,
    /// Info mapping of the originating process
    pub info: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, info: Map<String, Value>) -> Self {
        Self {
            kind,
            pipe: None,
            meta: Map::new(),
            info,
        }
    }

    pub fn with_pipe(mut self, pipe: impl Into<String>) -> Self {
        self.pipe = Some(pipe.into());
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    pub fn start(info: Map<String, Value>) -> Self {
        Self::new(EventKind::Start { time: now() }, info)
    }

    pub fn end(return_code: i32, info: Map<String, Value>) -> Self {
        Self::new(
            EventKind::End {
                time: now(),
                return_code,
            },
            info,
        )
    }

    /// Event name as it appears in the `event` key
    pub fn name(&self) -> &str {
        match &self.kind {
            EventKind::Start { .. } => "start",
            EventKind::Line(_) => "line",
            EventKind::Data(_) => "data",
            EventKind::Tagged { event, .. } => event,
            EventKind::FormatError { .. } => "format_error",
            EventKind::Binary(_) => "binary",
            EventKind::End { .. } => "end",
        }
    }

    /// The `data` member of the JSON rendering.
    ///
    /// Binary payloads are rendered lossily; the raw bytes stay on the event.
    pub fn data(&self) -> Value {
        match &self.kind {
            EventKind::Start { time } => json!({ "time": time }),
            EventKind::Line(text) => Value::String(text.clone()),
            EventKind::Data(data) => data.clone(),
            EventKind::Tagged { data, .. } => data.clone(),
            EventKind::FormatError {
                line,
                error,
                message,
            } => json!({ "line": line, "error": error, "message": message }),
            EventKind::Binary(raw) => Value::String(String::from_utf8_lossy(raw).into_owned()),
            EventKind::End { time, return_code } => {
                json!({ "time": time, "return_code": return_code })
            }
        }
    }

    pub fn return_code(&self) -> Option<i32> {
        match self.kind {
            EventKind::End { return_code, .. } => Some(return_code),
            _ => None,
        }
    }

    /// Flat JSON object: `event`, `data`, `pipe`, then metadata and info.
    ///
    /// Metadata and info never override the first three keys.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("event".to_string(), Value::String(self.name().to_string()));
        object.insert("data".to_string(), self.data());
        if let Some(pipe) = &self.pipe {
            object.insert("pipe".to_string(), Value::String(pipe.clone()));
        }
        for (key, value) in self.meta.iter().chain(self.info.iter()) {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(object)
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Seconds since the Unix epoch, with microsecond resolution
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Exit code of a finished process, or the negated signal number when it
/// was killed.
pub fn return_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("name".to_string(), json!("bench"));
        info
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Event::start(info()).name(), "start");
        assert_eq!(Event::end(0, info()).name(), "end");

        let tagged = Event::new(
            EventKind::Tagged {
                event: "rate".to_string(),
                data: json!(3),
            },
            info(),
        );
        assert_eq!(tagged.name(), "rate");
    }

    #[test]
    fn test_line_serialization() {
        let event = Event::new(EventKind::Line("hello\n".to_string()), info()).with_pipe("stdout");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({"event": "line", "data": "hello\n", "pipe": "stdout", "name": "bench"})
        );
    }

    #[test]
    fn test_end_serialization() {
        let event = Event::end(-9, info());
        assert_eq!(event.return_code(), Some(-9));

        let json = event.to_json();
        assert_eq!(json["event"], "end");
        assert_eq!(json["data"]["return_code"], -9);
        assert!(json["data"]["time"].as_f64().unwrap() > 0.0);
        assert!(json.get("pipe").is_none());
    }

    #[test]
    fn test_meta_cannot_override_reserved_keys() {
        let mut meta = Map::new();
        meta.insert("event".to_string(), json!("spoofed"));
        meta.insert("units".to_string(), json!("items/s"));
        let event = Event::new(EventKind::Data(json!({"x": 1})), info())
            .with_pipe("data")
            .with_meta(meta);

        let json = event.to_json();
        assert_eq!(json["event"], "data");
        assert_eq!(json["units"], "items/s");
        assert_eq!(json["data"], json!({"x": 1}));
    }

    #[test]
    fn test_binary_rendering() {
        let event = Event::new(EventKind::Binary(vec![0xc3, 0x28, b'!']), Map::new());
        assert_eq!(event.data(), json!("\u{fffd}(!"));
    }

    #[test]
    fn test_return_code() {
        assert_eq!(return_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(return_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(return_code(ExitStatus::from_raw(libc::SIGKILL)), -9);
    }
}
