use std::path::{Path, PathBuf};
use std::rc::Rc;

use events::return_code;
use serde_json::{json, Value};

use crate::error::{OverseerError, ProgramExit};

/// A runnable program.
pub trait EntryPoint {
    /// Run the program with its arguments and return its result.
    fn call(&self, argv: &[String]) -> anyhow::Result<Value>;
}

impl<F> EntryPoint for F
where
    F: Fn(&[String]) -> anyhow::Result<Value>,
{
    fn call(&self, argv: &[String]) -> anyhow::Result<Value> {
        self(argv)
    }
}

/// Turns the SCRIPT argument into something runnable.
pub trait ScriptResolver {
    fn resolve(&self, script: &str) -> anyhow::Result<Rc<dyn EntryPoint>>;
}

impl<F> ScriptResolver for F
where
    F: Fn(&str) -> anyhow::Result<Rc<dyn EntryPoint>>,
{
    fn resolve(&self, script: &str) -> anyhow::Result<Rc<dyn EntryPoint>> {
        self(script)
    }
}

/// Resolves SCRIPT to an executable, looked up in `PATH` unless it
/// contains a path separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandResolver;

impl ScriptResolver for CommandResolver {
    fn resolve(&self, script: &str) -> anyhow::Result<Rc<dyn EntryPoint>> {
        let program = if script.contains('/') {
            let path = PathBuf::from(script);
            if !path.is_file() {
                return Err(OverseerError::ProgramNotFound(script.to_string()).into());
            }
            path
        } else {
            which::which(script)
                .map_err(|_| OverseerError::ProgramNotFound(script.to_string()))?
        };
        tracing::debug!(program = %program.display(), "Resolved script");
        Ok(Rc::new(Executable { program }))
    }
}

/// An external executable. Returns its exit status; a non-zero status is a
/// [`ProgramExit`] failure.
#[derive(Debug, Clone)]
pub struct Executable {
    program: PathBuf,
}

impl Executable {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl EntryPoint for Executable {
    fn call(&self, argv: &[String]) -> anyhow::Result<Value> {
        let status = std::process::Command::new(&self.program)
            .args(argv)
            .status()
            .map_err(OverseerError::Io)?;
        let code = return_code(status);
        if code != 0 {
            return Err(ProgramExit { code }.into());
        }
        Ok(json!(code))
    }
}
