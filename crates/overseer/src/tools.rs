//! Helpers to build instruments that depend on the command line.

use std::rc::Rc;

use clap::{Arg, ArgAction};
use overwatch_core::{coroutine, Handler};

use crate::overseer::Ov;

/// Register the boolean flag `flag` during `init` and require `instrument`
/// once the arguments are parsed, if the flag was set.
pub fn gated(flag: &str, doc: Option<&str>, instrument: Rc<dyn Handler<Ov>>) -> Rc<dyn Handler<Ov>> {
    let long = flag.trim_start_matches('-').to_string();
    let id = long.replace('-', "_");
    let doc = doc.map(str::to_string);

    coroutine(move |ov: Ov| {
        let long = long.clone();
        let id = id.clone();
        let doc = doc.clone();
        let instrument = Rc::clone(&instrument);
        async move {
            let phases = ov.phases()?;
            phases.init.wait().await?;

            let mut arg = Arg::new(id.clone()).long(long).action(ArgAction::SetTrue);
            if let Some(doc) = doc {
                arg = arg.help(doc);
            }
            ov.add_argument(arg)?;

            phases.parse_args.wait().await?;
            let enabled = ov
                .options()
                .is_some_and(|options| matches!(options.try_get_one::<bool>(&id), Ok(Some(true))));
            if enabled {
                tracing::debug!(flag = %id, "Enabling gated instrument");
                ov.require(&instrument)?;
            }
            Ok(())
        }
    })
}

/// Register `arg` during `init`; when it is given a value, require the
/// instrument `factory` builds from it.
pub fn parametrized<F>(arg: Arg, factory: F) -> Rc<dyn Handler<Ov>>
where
    F: Fn(String) -> Rc<dyn Handler<Ov>> + 'static,
{
    let factory = Rc::new(factory);

    coroutine(move |ov: Ov| {
        let arg = arg.clone();
        let factory = Rc::clone(&factory);
        async move {
            let phases = ov.phases()?;
            phases.init.wait().await?;

            let id = arg.get_id().clone();
            ov.add_argument(arg)?;

            phases.parse_args.wait().await?;
            let value = ov
                .options()
                .and_then(|options| options.try_get_one::<String>(id.as_str()).ok().flatten().cloned());
            if let Some(value) = value {
                tracing::debug!(argument = %id, value = %value, "Enabling parametrized instrument");
                ov.require(&factory(value))?;
            }
            Ok(())
        }
    })
}
