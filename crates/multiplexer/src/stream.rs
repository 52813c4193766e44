use std::pin::Pin;
use std::task::{Context, Poll};

use events::LineDecoder;
use tokio::io::{AsyncRead, ReadBuf};

/// Upper bound on bytes taken from one stream per readiness round, so a
/// chatty stream cannot starve the others.
const MAX_ROUND_BYTES: usize = 64 * 1024;

const CHUNK_SIZE: usize = 8 * 1024;

/// Outcome of draining a stream during one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Drain {
    pub bytes: usize,
    pub eof: bool,
}

impl Drain {
    pub fn progressed(&self) -> bool {
        self.bytes > 0 || self.eof
    }
}

/// A readable handle of a supervised process, with its label and line policy.
pub struct Stream {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    label: String,
    decoder: LineDecoder,
    pending: Vec<u8>,
    closed: bool,
}

impl Stream {
    pub fn new(
        reader: impl AsyncRead + Unpin + Send + 'static,
        label: impl Into<String>,
        decoder: LineDecoder,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            label: label.into(),
            decoder,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// A stream of raw text lines
    pub fn text(reader: impl AsyncRead + Unpin + Send + 'static, label: impl Into<String>) -> Self {
        Self::new(reader, label, LineDecoder::Text)
    }

    /// A stream of JSON lines
    pub fn json(reader: impl AsyncRead + Unpin + Send + 'static, label: impl Into<String>) -> Self {
        Self::new(reader, label, LineDecoder::Json)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn decoder(&self) -> LineDecoder {
        self.decoder
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read whatever is available without blocking. Registers the waker
    /// when the reader runs dry.
    pub(crate) fn poll_drain(&mut self, cx: &mut Context<'_>) -> Drain {
        let mut drain = Drain::default();
        let mut chunk = [0u8; CHUNK_SIZE];

        while !self.closed && drain.bytes < MAX_ROUND_BYTES {
            let mut buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.reader).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                    self.closed = true;
                    drain.eof = true;
                }
                Poll::Ready(Ok(())) => {
                    self.pending.extend_from_slice(buf.filled());
                    drain.bytes += buf.filled().len();
                }
                Poll::Ready(Err(error)) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Poll::Ready(Err(error)) => {
                    tracing::warn!(stream = %self.label, %error, "Read failed, closing stream");
                    self.closed = true;
                    drain.eof = true;
                }
                Poll::Pending => break,
            }
        }
        drain
    }

    /// Complete lines read so far, newline included. With `flush`, a
    /// trailing partial line is returned as well.
    pub(crate) fn take_lines(&mut self, flush: bool) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset + 1;
            lines.push(self.pending[start..end].to_vec());
            start = end;
        }
        self.pending.drain(..start);

        if flush && !self.pending.is_empty() {
            lines.push(std::mem::take(&mut self.pending));
        }
        lines
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.label)
            .field("decoder", &self.decoder)
            .field("buffered", &self.pending.len())
            .field("closed", &self.closed)
            .finish()
    }
}
