use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;

use events::{DATA_FD_ENV, UNBUFFERED_ENV};
use tokio::net::unix::pipe::Receiver;
use tokio::process::{Child, Command};

use crate::error::{MultiplexerError, Result};
use crate::pipe::{data_pipe, set_cloexec};
use crate::stream::Stream;

/// How to launch a supervised process
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting ours
    pub env_clear: bool,
    pub cwd: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Spawn `argv` with piped stdout and stderr, plus a data channel whose
/// writing end is inherited by the child and advertised in `DATA_FD`.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn spawn(argv: &[OsString], options: &SpawnOptions) -> Result<(Child, Vec<Stream>)> {
    let (program, args) = argv.split_first().ok_or(MultiplexerError::EmptyCommand)?;
    let channel = data_pipe().map_err(MultiplexerError::Pipe)?;
    let write_fd = channel.writer.as_raw_fd();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if options.env_clear {
        command.env_clear();
    }
    command
        .envs(&options.env)
        .env(DATA_FD_ENV, write_fd.to_string())
        .env(UNBUFFERED_ENV, "1");
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }

    // SAFETY: the hook only calls fcntl, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || set_cloexec(write_fd, false));
    }

    let mut child = command.spawn().map_err(|source| MultiplexerError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    // The child holds its own copy; ours would keep the channel open forever.
    drop(channel.writer);

    let stdout = child
        .stdout
        .take()
        .ok_or(MultiplexerError::MissingStream("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(MultiplexerError::MissingStream("stderr"))?;
    let data = Receiver::from_owned_fd(channel.reader).map_err(MultiplexerError::Pipe)?;

    tracing::debug!(pid = child.id(), program = %program.to_string_lossy(), "Spawned process");

    let streams = vec![
        Stream::text(stdout, "stdout"),
        Stream::text(stderr, "stderr"),
        Stream::json(data, "data"),
    ];
    Ok((child, streams))
}
