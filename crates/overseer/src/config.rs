//! `--config` files: TOML tables whose scalar keys become argument defaults.

use std::path::{Path, PathBuf};

use clap::Command;
use serde_json::{Map, Value};

use crate::error::{OverseerError, Result};

const CONFIG_FLAG: &str = "--config";

/// Pull every `--config PATH` / `--config=PATH` out of `argv`.
/// Scanning stops at `--`.
pub(crate) fn split_config_args(argv: Vec<String>) -> Result<(Vec<PathBuf>, Vec<String>)> {
    let mut paths = Vec::new();
    let mut rest = Vec::with_capacity(argv.len());
    let mut args = argv.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--" {
            rest.push(arg);
            rest.extend(args.by_ref());
            break;
        }
        if arg == CONFIG_FLAG {
            let path = args.next().ok_or_else(|| OverseerError::Config {
                path: String::new(),
                message: format!("{CONFIG_FLAG} requires a path"),
            })?;
            paths.push(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            paths.push(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    Ok((paths, rest))
}

pub(crate) fn load_config(path: &Path) -> Result<Map<String, Value>> {
    let config_error = |message: String| OverseerError::Config {
        path: path.display().to_string(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
    let table: toml::Table = toml::from_str(&text).map_err(|e| config_error(e.to_string()))?;
    match serde_json::to_value(table).map_err(|e| config_error(e.to_string()))? {
        Value::Object(map) => Ok(map),
        _ => Err(config_error("expected a table".to_string())),
    }
}

/// Use `defaults` as default values of the matching arguments of `command`.
/// Keys match an argument's id or its long name.
pub(crate) fn apply_defaults(mut command: Command, defaults: &Map<String, Value>) -> Command {
    let targets: Vec<(String, String)> = command
        .get_arguments()
        .filter_map(|arg| {
            let id = arg.get_id().as_str().to_string();
            let value = defaults
                .get(&id)
                .or_else(|| arg.get_long().and_then(|long| defaults.get(long)))?;
            match scalar(value) {
                Some(text) => Some((id, text)),
                None => {
                    tracing::warn!(argument = %id, "Ignoring non-scalar config value");
                    None
                }
            }
        })
        .collect();

    for (id, text) in targets {
        tracing::debug!(argument = %id, default = %text, "Default from config");
        command = command.mut_arg(id, |arg| arg.default_value(text));
    }
    command
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
