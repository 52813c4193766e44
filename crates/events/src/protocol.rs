use serde_json::error::Category;
use serde_json::{Map, Value};

use crate::types::EventKind;

/// Reserved key naming a tagged record
pub const EVENT_KEY: &str = "$event";
/// Reserved key holding a tagged record's payload
pub const DATA_KEY: &str = "$data";

/// How lines read from a stream are turned into events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineDecoder {
    /// Raw text lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// A decoded line: the event payload plus any metadata of a tagged record
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub kind: EventKind,
    pub meta: Map<String, Value>,
}

impl Decoded {
    fn plain(kind: EventKind) -> Self {
        Self {
            kind,
            meta: Map::new(),
        }
    }
}

/// Decode one raw line (newline included). Never fails: undecodable input
/// becomes a `binary` or `format_error` payload.
pub fn decode_line(raw: &[u8], decoder: LineDecoder) -> Decoded {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Decoded::plain(EventKind::Binary(raw.to_vec())),
    };
    match decoder {
        LineDecoder::Text => Decoded::plain(EventKind::Line(text.to_string())),
        LineDecoder::Json => decode_json(text),
    }
}

fn decode_json(line: &str) -> Decoded {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(error) => {
            return format_error(line, category_name(error.classify()), error.to_string());
        }
    };

    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return format_error(
                line,
                "shape",
                format!("expected a JSON object, found {}", type_name(&other)),
            );
        }
    };

    match object.remove(EVENT_KEY) {
        None => Decoded::plain(EventKind::Data(Value::Object(object))),
        Some(Value::String(event)) => {
            let data = object.remove(DATA_KEY).unwrap_or(Value::Null);
            Decoded {
                kind: EventKind::Tagged { event, data },
                meta: object,
            }
        }
        Some(other) => format_error(
            line,
            "shape",
            format!("{EVENT_KEY} must be a string, found {}", type_name(&other)),
        ),
    }
}

fn format_error(line: &str, error: &str, message: String) -> Decoded {
    Decoded::plain(EventKind::FormatError {
        line: line.to_string(),
        error: error.to_string(),
        message,
    })
}

fn category_name(category: Category) -> &'static str {
    match category {
        Category::Io => "io",
        Category::Syntax => "syntax",
        Category::Data => "data",
        Category::Eof => "eof",
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_line() {
        let decoded = decode_line(b"hello world\n", LineDecoder::Text);
        assert_eq!(decoded.kind, EventKind::Line("hello world\n".to_string()));
        assert!(decoded.meta.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_binary() {
        let raw = b"\xc3\x28<hey>\n";
        for decoder in [LineDecoder::Text, LineDecoder::Json] {
            let decoded = decode_line(raw, decoder);
            assert_eq!(decoded.kind, EventKind::Binary(raw.to_vec()));
        }
    }

    #[test]
    fn test_plain_data() {
        let decoded = decode_line(b"{\"loss\": 0.5}\n", LineDecoder::Json);
        assert_eq!(decoded.kind, EventKind::Data(json!({"loss": 0.5})));
    }

    #[test]
    fn test_tagged_record() {
        let line = br#"{"$event": "rate", "$data": 12.5, "units": "items/s", "task": "train"}"#;
        let decoded = decode_line(line, LineDecoder::Json);

        assert_eq!(
            decoded.kind,
            EventKind::Tagged {
                event: "rate".to_string(),
                data: json!(12.5),
            }
        );
        assert_eq!(decoded.meta.len(), 2);
        assert_eq!(decoded.meta["units"], "items/s");
        assert_eq!(decoded.meta["task"], "train");
    }

    #[test]
    fn test_tagged_record_without_data() {
        let decoded = decode_line(br#"{"$event": "ping"}"#, LineDecoder::Json);
        assert_eq!(
            decoded.kind,
            EventKind::Tagged {
                event: "ping".to_string(),
                data: Value::Null,
            }
        );
    }

    #[test]
    fn test_syntax_error() {
        let decoded = decode_line(b"{\"x\": 1,,}\n", LineDecoder::Json);
        match decoded.kind {
            EventKind::FormatError {
                line,
                error,
                message,
            } => {
                assert_eq!(line, "{\"x\": 1,,}\n");
                assert_eq!(error, "syntax");
                assert!(!message.is_empty());
            }
            other => panic!("expected format_error, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_line() {
        let decoded = decode_line(b"{\"x\": ", LineDecoder::Json);
        assert!(matches!(decoded.kind, EventKind::FormatError { error, .. } if error == "eof"));
    }

    #[test]
    fn test_non_object_is_shape_error() {
        let decoded = decode_line(b"[1, 2, 3]\n", LineDecoder::Json);
        match decoded.kind {
            EventKind::FormatError { error, message, .. } => {
                assert_eq!(error, "shape");
                assert!(message.contains("array"));
            }
            other => panic!("expected format_error, got {other:?}"),
        }

        let decoded = decode_line(br#"{"$event": 3}"#, LineDecoder::Json);
        assert!(matches!(decoded.kind, EventKind::FormatError { error, .. } if error == "shape"));
    }
}
