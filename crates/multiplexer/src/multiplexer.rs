use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::task::{Context, Poll};
use std::time::Duration;

use events::{decode_line, return_code, Event};
use futures::Stream as FuturesStream;
use serde_json::{Map, Value};
use tokio::process::Child;

use crate::error::Result;
use crate::process::{spawn, SpawnOptions};
use crate::stream::Stream;

/// Handle of a process registered with a [`Multiplexer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One step of the multiplexed sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Event(Event),
    /// Nothing happened this round; only produced in non-blocking mode
    Idle,
}

impl Tick {
    pub fn into_event(self) -> Option<Event> {
        match self {
            Tick::Event(event) => Some(event),
            Tick::Idle => None,
        }
    }
}

struct Process {
    id: ProcessId,
    child: Child,
    info: Map<String, Value>,
    streams: Vec<Stream>,
    exit: Option<i32>,
    /// The exit was already known at the end of a previous round
    exit_settled: bool,
    round_bytes: usize,
}

impl Process {
    /// Poll for termination without consuming stream data.
    /// Returns true when the exit is newly observed.
    fn poll_exit(&mut self, cx: &mut Context<'_>) -> bool {
        if self.exit.is_some() {
            return false;
        }
        let wait = self.child.wait();
        futures::pin_mut!(wait);
        match wait.poll(cx) {
            Poll::Ready(Ok(status)) => {
                self.exit = Some(return_code(status));
                true
            }
            Poll::Ready(Err(error)) => {
                tracing::warn!(process = %self.id, %error, "Failed to wait for process");
                self.exit = Some(-1);
                true
            }
            Poll::Pending => false,
        }
    }

    fn check_exit(&mut self) -> Option<i32> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some(return_code(status)),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(process = %self.id, %error, "Failed to poll process");
                    self.exit = Some(-1);
                }
            }
        }
        self.exit
    }

    fn all_closed(&self) -> bool {
        self.streams.iter().all(Stream::is_closed)
    }

    fn decode(&mut self, flush: bool, out: &mut VecDeque<Tick>) {
        for stream in &mut self.streams {
            let flush = flush || stream.is_closed();
            for raw in stream.take_lines(flush) {
                let decoded = decode_line(&raw, stream.decoder());
                let event = Event::new(decoded.kind, self.info.clone())
                    .with_pipe(stream.label())
                    .with_meta(decoded.meta);
                out.push_back(Tick::Event(event));
            }
        }
    }
}

/// Merges the output of supervised processes into one event sequence.
///
/// Each round waits until at least one stream is readable or a process
/// exits, drains every readable stream, then ends the processes that were
/// quiet and have exited. The wait is bounded by the timeout given at
/// construction: `None` blocks, `Some(Duration::ZERO)` polls. With a
/// timeout, a [`Tick::Idle`] marker closes every round.
pub struct Multiplexer {
    processes: Vec<Process>,
    queue: VecDeque<Tick>,
    timeout: Option<Duration>,
    next_id: u64,
}

impl Multiplexer {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            processes: Vec::new(),
            queue: VecDeque::new(),
            timeout,
            next_id: 0,
        }
    }

    pub fn blocking() -> Self {
        Self::new(None)
    }

    pub fn is_blocking(&self) -> bool {
        self.timeout.is_none()
    }

    /// Number of processes that have not ended yet
    pub fn live(&self) -> usize {
        self.processes.len()
    }

    /// Spawn and register a process. A `start` event is queued right away.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<I, S>(
        &mut self,
        argv: I,
        info: Map<String, Value>,
        options: &SpawnOptions,
    ) -> Result<ProcessId>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
        let (child, streams) = spawn(&argv, options)?;
        self.queue
            .push_back(Tick::Event(Event::start(info.clone())));
        Ok(self.add_process(child, info, streams))
    }

    /// Register an already spawned process along with its streams.
    pub fn add_process(
        &mut self,
        child: Child,
        info: Map<String, Value>,
        streams: Vec<Stream>,
    ) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        tracing::debug!(process = %id, pid = child.id(), streams = streams.len(), "Registered process");
        self.processes.push(Process {
            id,
            child,
            info,
            streams,
            exit: None,
            exit_settled: false,
            round_bytes: 0,
        });
        id
    }

    /// Next tick, or `None` once every process has ended and all events
    /// were handed out.
    pub async fn next(&mut self) -> Option<Tick> {
        loop {
            if let Some(tick) = self.queue.pop_front() {
                return Some(tick);
            }
            if self.processes.is_empty() {
                return None;
            }
            self.round().await;
        }
    }

    /// Next event, skipping idle markers
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.next().await? {
                Tick::Event(event) => return Some(event),
                Tick::Idle => continue,
            }
        }
    }

    pub fn into_stream(self) -> impl FuturesStream<Item = Tick> {
        futures::stream::unfold(self, |mut mux| async move {
            mux.next().await.map(|tick| (tick, mux))
        })
    }

    async fn round(&mut self) {
        for process in &mut self.processes {
            process.round_bytes = 0;
        }

        let timeout = self.timeout;
        let ready = futures::future::poll_fn(|cx| self.poll_ready(cx));
        match timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, ready).await;
            }
            None => ready.await,
        }

        let mut index = 0;
        while index < self.processes.len() {
            let process = &mut self.processes[index];
            let active = process.round_bytes > 0;
            process.decode(false, &mut self.queue);

            let ended = if active {
                None
            } else {
                process
                    .check_exit()
                    .filter(|_| process.exit_settled || process.all_closed())
            };

            match ended {
                Some(code) => {
                    let mut process = self.processes.remove(index);
                    process.decode(true, &mut self.queue);
                    tracing::debug!(process = %process.id, return_code = code, "Process ended");
                    self.queue
                        .push_back(Tick::Event(Event::end(code, process.info)));
                }
                None => {
                    process.exit_settled = process.exit.is_some();
                    index += 1;
                }
            }
        }

        if !self.is_blocking() {
            self.queue.push_back(Tick::Idle);
        }
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut ready = self.processes.is_empty();
        for process in &mut self.processes {
            if process.poll_exit(cx) || process.exit.is_some() {
                ready = true;
            }
            for stream in &mut process.streams {
                let drain = stream.poll_drain(cx);
                process.round_bytes += drain.bytes;
                ready |= drain.progressed();
            }
        }
        if ready {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("live", &self.processes.len())
            .field("queued", &self.queue.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
