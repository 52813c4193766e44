use std::fmt;
use std::rc::Rc;

use clap::ArgMatches;
use serde_json::Value;

use crate::resolver::EntryPoint;

/// The program resolved during `load_script`
#[derive(Clone)]
pub struct LoadedScript {
    pub script: String,
    pub argv: Vec<String>,
    pub entry: Rc<dyn EntryPoint>,
}

impl fmt::Debug for LoadedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedScript")
            .field("script", &self.script)
            .field("argv", &self.argv)
            .finish_non_exhaustive()
    }
}

/// Value carried by an overseer phase.
#[derive(Debug, Clone)]
pub enum PhaseValue {
    /// `parse_args`: the parsed command line
    Options(Rc<ArgMatches>),
    /// `load_script`: the resolved program
    Script(LoadedScript),
    /// `run_script`: what the program returned
    Returned(Value),
}

impl PhaseValue {
    pub fn as_options(&self) -> Option<&ArgMatches> {
        match self {
            Self::Options(matches) => Some(matches),
            _ => None,
        }
    }

    pub fn as_script(&self) -> Option<&LoadedScript> {
        match self {
            Self::Script(script) => Some(script),
            _ => None,
        }
    }

    pub fn as_returned(&self) -> Option<&Value> {
        match self {
            Self::Returned(value) => Some(value),
            _ => None,
        }
    }
}
