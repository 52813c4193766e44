//! Instruments shipped with the overseer.

use std::rc::Rc;
use std::time::Instant;

use overwatch_core::{coroutine, Handler};
use serde_json::json;

use crate::overseer::Ov;

/// Resumes ahead of other `run_script` instruments so their work is not
/// counted.
const WALLTIME_PRIORITY: i32 = 100;

/// Gives `{"$event": "walltime", "$data": {"seconds": ..}}` with the time
/// spent in `run_script`, whether the program succeeded or not.
pub fn walltime() -> Rc<dyn Handler<Ov>> {
    coroutine(|ov: Ov| async move {
        let phases = ov.phases()?;
        phases.load_script.wait().await?;
        let started = Instant::now();

        let outcome = phases.run_script.at(WALLTIME_PRIORITY).await;
        let seconds = started.elapsed().as_secs_f64();
        tracing::debug!(seconds, "Program finished");
        ov.give(json!({ "$event": "walltime", "$data": { "seconds": seconds } }));
        outcome?;
        Ok(())
    })
}
