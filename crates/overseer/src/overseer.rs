use std::cell::{Cell, OnceCell, RefCell};
use std::rc::{Rc, Weak};

use clap::{Arg, ArgMatches, Command};
use events::{JsonlWriter, LogTarget, EVENT_KEY};
use overwatch_core::{CoreError, Handler, Phase, PhaseFailure, PhaseRunner, RevisitPolicy};
use serde_json::{json, Map, Value};

use crate::config::{apply_defaults, load_config, split_config_args};
use crate::error::{error_type, OverseerError, Result, StopProgram};
use crate::resolver::{CommandResolver, ScriptResolver};
use crate::value::{LoadedScript, PhaseValue};

pub const INIT: &str = "init";
pub const PARSE_ARGS: &str = "parse_args";
pub const LOAD_SCRIPT: &str = "load_script";
pub const RUN_SCRIPT: &str = "run_script";
pub const FINALIZE: &str = "finalize";

/// The overseer's phases, in the order they are advanced.
pub const PHASE_NAMES: [&str; 5] = [INIT, PARSE_ARGS, LOAD_SCRIPT, RUN_SCRIPT, FINALIZE];

const SCRIPT_ARG: &str = "SCRIPT";

type Sink = Rc<dyn Fn(&Value)>;

/// Handles on every phase of an overseer run.
#[derive(Debug, Clone)]
pub struct Phases {
    pub start: Phase<PhaseValue>,
    pub init: Phase<PhaseValue>,
    pub parse_args: Phase<PhaseValue>,
    pub load_script: Phase<PhaseValue>,
    pub run_script: Phase<PhaseValue>,
    pub finalize: Phase<PhaseValue>,
}

impl Phases {
    fn from_runner(runner: &PhaseRunner<Ov, PhaseValue>) -> Result<Self> {
        let phase = |name: &str| {
            runner
                .phase(name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownPhase(name.to_string()))
        };
        Ok(Self {
            start: runner.start().clone(),
            init: phase(INIT)?,
            parse_args: phase(PARSE_ARGS)?,
            load_script: phase(LOAD_SCRIPT)?,
            run_script: phase(RUN_SCRIPT)?,
            finalize: phase(FINALIZE)?,
        })
    }
}

/// How a run ended when the program did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The program ran to completion and returned this value
    Completed(Value),
    /// The program or an instrument raised [`StopProgram`]
    Stopped,
}

/// Settings of an [`Overseer`].
#[derive(Clone)]
pub struct OverseerOptions {
    pub logfile: Option<LogTarget>,
    pub resolver: Rc<dyn ScriptResolver>,
    pub revisit: RevisitPolicy,
}

impl Default for OverseerOptions {
    fn default() -> Self {
        Self {
            logfile: None,
            resolver: Rc::new(CommandResolver),
            revisit: RevisitPolicy::default(),
        }
    }
}

impl OverseerOptions {
    pub fn with_logfile(mut self, logfile: LogTarget) -> Self {
        self.logfile = Some(logfile);
        self
    }

    pub fn with_resolver(mut self, resolver: impl ScriptResolver + 'static) -> Self {
        self.resolver = Rc::new(resolver);
        self
    }

    pub fn with_revisit(mut self, revisit: RevisitPolicy) -> Self {
        self.revisit = revisit;
        self
    }
}

struct Engine {
    runner: PhaseRunner<Ov, PhaseValue>,
    phases: Phases,
}

struct Inner {
    engine: OnceCell<Engine>,
    command: RefCell<Option<Command>>,
    options: RefCell<Option<Rc<ArgMatches>>>,
    defaults: RefCell<Map<String, Value>>,
    given: RefCell<Vec<Sink>>,
    logged: RefCell<Vec<Sink>>,
    writer: RefCell<Option<JsonlWriter>>,
    logfile: Option<LogTarget>,
    resolver: Rc<dyn ScriptResolver>,
    ran: Cell<bool>,
    stopped: Cell<bool>,
}

impl Inner {
    fn engine(&self) -> Result<&Engine> {
        self.engine.get().ok_or(OverseerError::Detached)
    }

    fn give(&self, data: Value) {
        let sinks = self.given.borrow().clone();
        for sink in &sinks {
            sink(&data);
        }
        if data.get(EVENT_KEY).is_some() {
            self.log(&data);
        }
    }

    fn log(&self, record: &Value) {
        if let Some(writer) = self.writer.borrow_mut().as_mut() {
            writer.log(record);
        }
        let sinks = self.logged.borrow().clone();
        for sink in &sinks {
            sink(record);
        }
    }

    fn report(&self, error: anyhow::Error) {
        if is_stop(&error) {
            tracing::info!("An instrument stopped the program");
            self.stopped.set(true);
            return;
        }
        tracing::error!(
            error = %format!("{error:#}"),
            "An instrument failed; execution proceeds as normal"
        );
        self.log(&json!({
            "$event": "overseer_error",
            "$data": { "type": error_type(&error), "message": error.to_string() },
        }));
    }
}

/// The handle every instrument receives.
///
/// It only holds a weak reference to its overseer; using it after the
/// overseer was dropped yields [`OverseerError::Detached`].
#[derive(Clone)]
pub struct Ov {
    inner: Weak<Inner>,
}

impl Ov {
    fn upgrade(&self) -> Result<Rc<Inner>> {
        self.inner.upgrade().ok_or(OverseerError::Detached)
    }

    pub fn phases(&self) -> Result<Phases> {
        Ok(self.upgrade()?.engine()?.phases.clone())
    }

    /// Parsed command line, available once `parse_args` succeeded.
    pub fn options(&self) -> Option<Rc<ArgMatches>> {
        let inner = self.inner.upgrade()?;
        let options = inner.options.borrow().clone();
        options
    }

    /// Register a command-line argument. Only possible before `parse_args`.
    pub fn add_argument(&self, arg: Arg) -> Result<()> {
        let inner = self.upgrade()?;
        let mut command = inner.command.borrow_mut();
        let current = command.take().ok_or(OverseerError::ArgumentsParsed)?;
        *command = Some(current.arg(arg));
        Ok(())
    }

    /// Push `data` to the given subscribers. Objects carrying `$event` are
    /// also logged.
    pub fn give(&self, data: Value) {
        match self.inner.upgrade() {
            Some(inner) => inner.give(data),
            None => tracing::debug!("Dropping data given to a detached overseer"),
        }
    }

    pub fn log(&self, record: Value) {
        match self.inner.upgrade() {
            Some(inner) => inner.log(&record),
            None => tracing::debug!("Dropping record logged to a detached overseer"),
        }
    }

    pub fn on_given(&self, sink: impl Fn(&Value) + 'static) -> Result<()> {
        self.upgrade()?.given.borrow_mut().push(Rc::new(sink));
        Ok(())
    }

    pub fn on_log(&self, sink: impl Fn(&Value) + 'static) -> Result<()> {
        self.upgrade()?.logged.borrow_mut().push(Rc::new(sink));
        Ok(())
    }

    /// Add an instrument. Requiring the same instrument again does nothing.
    pub fn require(&self, instrument: &Rc<dyn Handler<Ov>>) -> Result<()> {
        self.upgrade()?.engine()?.runner.add(instrument);
        Ok(())
    }
}

/// Runs a program under instruments, through the phases `init`,
/// `parse_args`, `load_script`, `run_script` and `finalize`.
pub struct Overseer {
    inner: Rc<Inner>,
}

impl Overseer {
    pub fn new<I>(instruments: I) -> Result<Self>
    where
        I: IntoIterator<Item = Rc<dyn Handler<Ov>>>,
    {
        Self::with_options(instruments, OverseerOptions::default())
    }

    pub fn with_options<I>(instruments: I, options: OverseerOptions) -> Result<Self>
    where
        I: IntoIterator<Item = Rc<dyn Handler<Ov>>>,
    {
        let inner = Rc::new(Inner {
            engine: OnceCell::new(),
            command: RefCell::new(Some(base_command())),
            options: RefCell::new(None),
            defaults: RefCell::new(Map::new()),
            given: RefCell::new(Vec::new()),
            logged: RefCell::new(Vec::new()),
            writer: RefCell::new(None),
            logfile: options.logfile,
            resolver: options.resolver,
            ran: Cell::new(false),
            stopped: Cell::new(false),
        });

        let context = Ov {
            inner: Rc::downgrade(&inner),
        };
        let reporter = context.clone();
        let runner = PhaseRunner::new(PHASE_NAMES, context, move |error| {
            if let Some(inner) = reporter.inner.upgrade() {
                inner.report(error);
            }
        })?
        .with_revisit(options.revisit);
        let phases = Phases::from_runner(&runner)?;
        inner.engine.get_or_init(move || Engine { runner, phases });

        let overseer = Self { inner };
        for instrument in instruments {
            overseer.require(&instrument)?;
        }
        Ok(overseer)
    }

    /// The handle instruments receive.
    pub fn context(&self) -> Ov {
        Ov {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn phases(&self) -> Result<Phases> {
        self.context().phases()
    }

    pub fn require(&self, instrument: &Rc<dyn Handler<Ov>>) -> Result<()> {
        self.context().require(instrument)
    }

    pub fn on_given(&self, sink: impl Fn(&Value) + 'static) -> Result<()> {
        self.context().on_given(sink)
    }

    pub fn on_log(&self, sink: impl Fn(&Value) + 'static) -> Result<()> {
        self.context().on_log(sink)
    }

    /// Run the program named by `argv` (overseer options, SCRIPT, then the
    /// program's own arguments).
    ///
    /// `finalize` is advanced on every path. A failure of the program or of
    /// one of the overseer's own phases is logged as an `error` event and
    /// returned after cleanup.
    pub fn run<I, S>(&self, argv: I) -> Result<RunOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.inner.ran.replace(true) {
            return Err(OverseerError::AlreadyRan);
        }
        let engine = self.inner.engine()?;
        if let Some(target) = &self.inner.logfile {
            *self.inner.writer.borrow_mut() = Some(JsonlWriter::open(target, false)?);
        }

        let argv = argv.into_iter().map(Into::into).collect();
        let result = self.run_body(engine, argv);

        if let Err((phase, failure)) = &result {
            if failure.downcast_ref::<StopProgram>().is_none() {
                tracing::warn!(phase = %phase, error = %failure, "Run failed");
                self.inner.log(&json!({
                    "$event": "error",
                    "$data": { "type": error_type(failure.error()), "message": failure.to_string() },
                }));
            }
        }

        let finalized = self.advance(engine, &engine.phases.finalize, || Ok(None));
        if let (Err(failure), Err(_)) = (&finalized, &result) {
            tracing::warn!(error = %failure, "Finalize failed after a failed run");
        }
        if let Some(mut writer) = self.inner.writer.borrow_mut().take() {
            writer.flush();
        }

        match result {
            Ok(value) => {
                if let Err(failure) = finalized {
                    return Err(OverseerError::Phase {
                        phase: FINALIZE,
                        failure,
                    });
                }
                Ok(RunOutcome::Completed(value))
            }
            Err((_, failure)) if failure.downcast_ref::<StopProgram>().is_some() => {
                tracing::info!("Program stopped");
                Ok(RunOutcome::Stopped)
            }
            Err((phase, failure)) => Err(OverseerError::Phase { phase, failure }),
        }
    }

    fn run_body(
        &self,
        engine: &Engine,
        argv: Vec<String>,
    ) -> std::result::Result<Value, (&'static str, PhaseFailure)> {
        let inner = &self.inner;
        let phases = &engine.phases;

        let mut rest = Vec::new();
        self.advance(engine, &phases.init, || {
            let (paths, remaining) = split_config_args(argv)?;
            for path in paths {
                let config = load_config(&path)?;
                inner.defaults.borrow_mut().extend(config);
            }
            rest = remaining;
            Ok(None)
        })
        .map_err(|failure| (INIT, failure))?;
        self.check_stopped(INIT)?;

        let options = self
            .advance(engine, &phases.parse_args, || {
                let command = inner
                    .command
                    .borrow_mut()
                    .take()
                    .ok_or(OverseerError::ArgumentsParsed)?;
                let command = apply_defaults(command, &inner.defaults.borrow());
                let matches = Rc::new(command.try_get_matches_from(rest)?);
                *inner.options.borrow_mut() = Some(Rc::clone(&matches));
                Ok(Some(PhaseValue::Options(matches)))
            })
            .map_err(|failure| (PARSE_ARGS, failure))?;
        self.check_stopped(PARSE_ARGS)?;

        let loaded = self
            .advance(engine, &phases.load_script, || {
                let matches = options
                    .as_ref()
                    .and_then(PhaseValue::as_options)
                    .ok_or(OverseerError::MissingScript)?;
                let mut words: Vec<String> = matches
                    .try_get_many::<String>(SCRIPT_ARG)
                    .ok()
                    .flatten()
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default();
                if words.is_empty() {
                    return Err(OverseerError::MissingScript.into());
                }
                let script = words.remove(0);
                tracing::debug!(script = %script, "Loading script");
                let entry = inner.resolver.resolve(&script)?;
                Ok(Some(PhaseValue::Script(LoadedScript {
                    script,
                    argv: words,
                    entry,
                })))
            })
            .map_err(|failure| (LOAD_SCRIPT, failure))?;
        self.check_stopped(LOAD_SCRIPT)?;

        let returned = self
            .advance(engine, &phases.run_script, || {
                let loaded = loaded
                    .as_ref()
                    .and_then(PhaseValue::as_script)
                    .ok_or(OverseerError::MissingScript)?;
                tracing::info!(script = %loaded.script, argv = ?loaded.argv, "Running script");
                let value = loaded.entry.call(&loaded.argv)?;
                Ok(Some(PhaseValue::Returned(value)))
            })
            .map_err(|failure| (RUN_SCRIPT, failure))?;
        self.check_stopped(RUN_SCRIPT)?;

        Ok(returned
            .as_ref()
            .and_then(PhaseValue::as_returned)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Skip the remaining body phases once an instrument raised
    /// [`StopProgram`].
    fn check_stopped(
        &self,
        phase: &'static str,
    ) -> std::result::Result<(), (&'static str, PhaseFailure)> {
        if self.inner.stopped.get() {
            return Err((phase, PhaseFailure::new(StopProgram)));
        }
        Ok(())
    }

    /// Log the phase, run its body, then hand the outcome to the instruments
    /// waiting on it.
    fn advance(
        &self,
        engine: &Engine,
        phase: &Phase<PhaseValue>,
        body: impl FnOnce() -> anyhow::Result<Option<PhaseValue>>,
    ) -> std::result::Result<Option<PhaseValue>, PhaseFailure> {
        tracing::debug!(phase = %phase.name(), "Advancing phase");
        self.inner
            .log(&json!({ "$event": "phase", "$data": { "name": phase.name() } }));

        let outcome = body().map_err(PhaseFailure::new);
        let (value, exception) = match &outcome {
            Ok(value) => (value.clone(), None),
            Err(failure) => (None, Some(failure.clone())),
        };
        engine
            .runner
            .run_phase(phase, value, exception)
            .map_err(PhaseFailure::new)?;
        outcome
    }
}

fn is_stop(error: &anyhow::Error) -> bool {
    error.downcast_ref::<StopProgram>().is_some()
        || error
            .downcast_ref::<PhaseFailure>()
            .is_some_and(|failure| failure.downcast_ref::<StopProgram>().is_some())
}

fn base_command() -> Command {
    Command::new("overseer")
        .no_binary_name(true)
        .arg(
            Arg::new(SCRIPT_ARG)
                .value_name("SCRIPT")
                .help("The program to run, followed by its arguments")
                .num_args(1..)
                .trailing_var_arg(true),
        )
}
