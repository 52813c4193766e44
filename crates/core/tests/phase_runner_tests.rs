use std::cell::RefCell;
use std::rc::{Rc, Weak};

use overwatch_core::{
    coroutine, eager, Handler, Invocation, Phase, PhaseFailure, PhaseRunner, RevisitPolicy,
};

type Runner = PhaseRunner<Ctx, i64>;
type Log = Rc<RefCell<Vec<String>>>;

const PHASES: [&str; 4] = ["one", "two", "three", "four"];

/// Context handed to every handler: a back-reference to the runner and
/// the shared trace of what happened.
#[derive(Clone)]
struct Ctx {
    runner: Weak<Runner>,
    seq: Log,
}

impl Ctx {
    fn runner(&self) -> Rc<Runner> {
        self.runner.upgrade().expect("runner dropped")
    }

    fn phase(&self, name: &str) -> Phase<i64> {
        self.runner().phase(name).expect("unknown phase").clone()
    }

    fn log(&self, entry: impl Into<String>) {
        self.seq.borrow_mut().push(entry.into());
    }

    fn add(&self, handler: &Rc<dyn Handler<Ctx>>) {
        self.runner().add(handler);
    }
}

struct LightOverseer {
    runner: Rc<Runner>,
    results: Log,
    errors: Log,
}

impl LightOverseer {
    fn new() -> Self {
        Self::with_revisit(RevisitPolicy::Park)
    }

    fn with_revisit(revisit: RevisitPolicy) -> Self {
        let results: Log = Rc::default();
        let errors: Log = Rc::default();
        let sink = Rc::clone(&errors);
        let seq = Rc::clone(&results);
        let runner = Rc::new_cyclic(|weak| {
            let ctx = Ctx {
                runner: weak.clone(),
                seq,
            };
            PhaseRunner::new(PHASES, ctx, move |error| {
                sink.borrow_mut().push(error.to_string())
            })
            .unwrap()
            .with_revisit(revisit)
        });
        Self {
            runner,
            results,
            errors,
        }
    }

    fn add(&self, handler: &Rc<dyn Handler<Ctx>>) {
        self.runner.add(handler);
    }

    fn phase(&self, name: &str) -> Phase<i64> {
        self.runner.phase(name).unwrap().clone()
    }

    fn advance(&self, name: &str, input: Result<i64, &'static str>) -> Result<(), PhaseFailure> {
        let phase = self.phase(name);
        match input {
            Ok(value) => {
                self.results.borrow_mut().push(value.to_string());
                self.runner.run_phase(&phase, Some(value), None).unwrap();
                Ok(())
            }
            Err(message) => {
                self.results.borrow_mut().push(format!("!{message}"));
                let failure = PhaseFailure::new(anyhow::anyhow!(message));
                self.runner
                    .run_phase(&phase, None, Some(failure.clone()))
                    .unwrap();
                Err(failure)
            }
        }
    }

    fn run_with(&self, inputs: [Result<i64, &'static str>; 4]) -> Result<(), PhaseFailure> {
        for (name, input) in PHASES.into_iter().zip(inputs) {
            self.advance(name, input)?;
        }
        self.results.borrow_mut().push("5".to_string());
        Ok(())
    }

    fn run(&self) {
        self.run_with([Ok(1), Ok(2), Ok(3), Ok(4)]).unwrap();
    }

    fn results(&self) -> Vec<String> {
        self.results.borrow().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn appender(prefix: &'static str) -> Rc<dyn Handler<Ctx>> {
    coroutine(move |ov: Ctx| async move {
        ov.log(format!("{prefix}0"));
        ov.phase("one").wait().await?;
        ov.log(format!("{prefix}1"));
        ov.phase("two").wait().await?;
        ov.log(format!("{prefix}2"));
        ov.phase("three").wait().await?;
        ov.log(format!("{prefix}3"));
        ov.phase("four").wait().await?;
        ov.log(format!("{prefix}4"));
        Ok(())
    })
}

#[test]
fn test_single() {
    let ov = LightOverseer::new();
    ov.add(&appender("A"));
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&["A0", "1", "A1", "2", "A2", "3", "A3", "4", "A4", "5"])
    );
    assert!(ov.errors().is_empty());
}

#[test]
fn test_dual() {
    let ov = LightOverseer::new();
    ov.add(&appender("A"));
    ov.add(&appender("B"));
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&[
            "A0", "B0", "1", "A1", "B1", "2", "A2", "B2", "3", "A3", "B3", "4", "A4", "B4", "5",
        ])
    );
    assert!(ov.errors().is_empty());
}

#[test]
fn test_order() {
    let handler_a = coroutine(|ov: Ctx| async move {
        ov.log("A0");
        ov.phase("one").wait().await?;
        ov.log("A1");
        ov.phase("two").at(1).await?;
        ov.log("A2");
        ov.phase("three").at(-1).await?;
        ov.log("A3");
        ov.phase("four").wait().await?;
        ov.log("A4");
        Ok(())
    });
    let handler_b = coroutine(|ov: Ctx| async move {
        ov.log("B0");
        ov.phase("one").wait().await?;
        ov.log("B1");
        ov.phase("two").at(2).await?;
        ov.log("B2");
        ov.phase("three").wait().await?;
        ov.log("B3");
        ov.phase("four").at(1).await?;
        ov.log("B4");
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler_a);
    ov.add(&handler_b);
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&[
            "A0", "B0", "1", "A1", "B1", "2", "B2", "A2", "3", "B3", "A3", "4", "B4", "A4", "5",
        ])
    );
    assert!(ov.errors().is_empty());
}

fn skip_to_two() -> Rc<dyn Handler<Ctx>> {
    coroutine(|ov: Ctx| async move {
        ov.log("A0");
        ov.phase("two").wait().await?;
        ov.log("A2");
        Ok(())
    })
}

#[test]
fn test_partial_phases() {
    let ov = LightOverseer::new();
    ov.add(&skip_to_two());
    ov.run();

    assert_eq!(ov.results(), strings(&["A0", "1", "2", "A2", "3", "4", "5"]));
    assert!(ov.errors().is_empty());
}

#[test]
fn test_add_multiple_copies() {
    let ov = LightOverseer::new();
    let handler = skip_to_two();
    ov.add(&handler);
    ov.add(&handler);
    ov.add(&handler);
    ov.run();

    assert_eq!(ov.results(), strings(&["A0", "1", "2", "A2", "3", "4", "5"]));
    assert!(ov.errors().is_empty());
}

#[test]
fn test_reenter_running_phase() {
    let handler = coroutine(|ov: Ctx| async move {
        ov.log("A0");
        ov.phase("one").wait().await?;
        ov.log("A1.1");
        ov.phase("one").wait().await?;
        ov.log("A1.2");
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler);
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&["A0", "1", "A1.1", "A1.2", "2", "3", "4", "5"])
    );
    assert!(ov.errors().is_empty());
}

#[test]
fn test_sandwiched_order() {
    let handler_a = coroutine(|ov: Ctx| async move {
        ov.phase("two").at(10).await?;
        ov.log("A2.1");
        ov.phase("two").at(5).await?;
        ov.log("A2.2");
        ov.phase("two").at(-10).await?;
        ov.log("A2.3");
        Ok(())
    });
    let handler_b = coroutine(|ov: Ctx| async move {
        ov.phase("two").wait().await?;
        ov.log("B2.1");
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler_a);
    ov.add(&handler_b);
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&["1", "2", "A2.1", "A2.2", "B2.1", "A2.3", "3", "4", "5"])
    );
    assert!(ov.errors().is_empty());
}

#[test]
fn test_add_by_handler() {
    let handler_b = coroutine(|ov: Ctx| async move {
        ov.log("B0");
        ov.phase("one").wait().await?;
        ov.log("B1");
        ov.phase("two").at(2).await?;
        ov.log("B2");
        ov.phase("three").wait().await?;
        ov.log("B3");
        ov.phase("four").at(1).await?;
        ov.log("B4");
        Ok(())
    });
    let handler_a = coroutine(move |ov: Ctx| {
        let handler_b = Rc::clone(&handler_b);
        async move {
            ov.log("A0");
            ov.phase("one").wait().await?;
            ov.log("A1");
            ov.phase("two").at(1).await?;
            ov.log("A2.1");
            ov.add(&handler_b);
            ov.log("A2.2");
            ov.phase("three").at(-1).await?;
            ov.log("A3");
            ov.phase("four").wait().await?;
            ov.log("A4");
            Ok(())
        }
    });

    let ov = LightOverseer::new();
    ov.add(&handler_a);
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&[
            "A0", "1", "A1", "2", "A2.1", "B0", "B1", "A2.2", "B2", "3", "B3", "A3", "4", "B4",
            "A4", "5",
        ])
    );
    assert!(ov.errors().is_empty());
}

#[test]
fn test_values_replay_done_phase() {
    let handler = coroutine(|ov: Ctx| async move {
        assert_eq!(ov.phase("one").wait().await?, Some(1));
        assert_eq!(ov.phase("two").wait().await?, Some(2));
        assert_eq!(ov.phase("three").wait().await?, Some(3));
        assert_eq!(ov.phase("one").wait().await?, Some(1));
        assert_eq!(ov.phase("four").wait().await?, Some(4));
        ov.log("checked");
        Ok(())
    });

    let ov = LightOverseer::with_revisit(RevisitPolicy::Replay);
    ov.add(&handler);
    ov.run();

    assert!(ov.results().contains(&"checked".to_string()));
    assert!(ov.errors().is_empty());
}

#[test]
fn test_done_phase_parks_until_next_advance() {
    let handler = coroutine(|ov: Ctx| async move {
        let first = ov.phase("two").wait().await?;
        ov.log(format!("first={first:?}"));
        ov.phase("three").wait().await?;
        let second = ov.phase("two").wait().await?;
        ov.log(format!("second={second:?}"));
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler);
    ov.run();

    let two = ov.phase("two");
    assert_eq!(
        ov.results(),
        strings(&["1", "2", "first=Some(2)", "3", "4", "5"])
    );
    assert_eq!(ov.runner.pending(&two), 1);

    ov.advance("two", Ok(22)).unwrap();
    assert_eq!(
        ov.results(),
        strings(&["1", "2", "first=Some(2)", "3", "4", "5", "22", "second=Some(22)"])
    );
    assert_eq!(ov.runner.pending(&two), 0);
    assert!(ov.errors().is_empty());
}

#[test]
fn test_late_handler_catches_up() {
    let ov = LightOverseer::new();
    ov.advance("one", Ok(1)).unwrap();
    ov.advance("two", Ok(2)).unwrap();

    ov.add(&appender("L"));
    ov.advance("three", Ok(3)).unwrap();
    ov.advance("four", Ok(4)).unwrap();

    assert_eq!(
        ov.results(),
        strings(&["1", "2", "L0", "L1", "L2", "3", "L3", "4", "L4"])
    );
    assert!(ov.errors().is_empty());
}

#[test]
fn test_done() {
    let handler = coroutine(|ov: Ctx| async move {
        assert!(ov.runner().start().is_done());

        ov.phase("one").wait().await?;
        assert!(!ov.phase("one").is_done());

        ov.phase("two").wait().await?;
        assert!(ov.phase("one").is_done());
        assert!(!ov.phase("two").is_done());

        ov.phase("three").wait().await?;
        assert!(ov.phase("two").is_done());
        assert!(!ov.phase("three").is_done());

        ov.phase("four").wait().await?;
        assert!(ov.phase("three").is_done());
        assert!(!ov.phase("four").is_done());
        ov.log("checked");
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler);
    ov.run();
    assert!(ov.results().contains(&"checked".to_string()));
    assert!(ov.errors().is_empty());
}

#[test]
fn test_running() {
    let handler = coroutine(|ov: Ctx| async move {
        assert!(!ov.runner().start().is_running());

        assert!(!ov.phase("one").is_running());
        ov.phase("one").wait().await?;
        assert!(ov.phase("one").is_running());

        assert!(!ov.phase("two").is_running());
        ov.phase("two").wait().await?;
        assert!(ov.phase("two").is_running());
        assert!(!ov.phase("one").is_running());

        ov.phase("four").wait().await?;
        assert!(ov.phase("four").is_running());
        assert!(!ov.phase("three").is_running());
        ov.log("checked");
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler);
    ov.run();
    assert!(ov.results().contains(&"checked".to_string()));
    assert!(ov.errors().is_empty());
}

#[test]
fn test_runner_error() {
    let reraise = coroutine(|ov: Ctx| async move {
        if let Err(failure) = ov.phase("two").wait().await {
            ov.log("error1");
            return Err(failure.into());
        }
        Ok(())
    });
    let replace = coroutine(|ov: Ctx| async move {
        if ov.phase("two").wait().await.is_err() {
            ov.log("error2");
            anyhow::bail!("unrelated");
        }
        Ok(())
    });
    let absorb = coroutine(|ov: Ctx| async move {
        if ov.phase("two").wait().await.is_err() {
            ov.log("error3");
        }
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&reraise);
    ov.add(&replace);
    ov.add(&absorb);
    let failure = ov.run_with([Ok(1), Err("uh oh"), Ok(3), Ok(4)]).unwrap_err();

    assert_eq!(failure.to_string(), "uh oh");
    assert_eq!(
        ov.results(),
        strings(&["1", "!uh oh", "error1", "error2", "error3"])
    );
    assert_eq!(ov.errors(), strings(&["unrelated"]));
    assert!(ov.phase("two").exception().unwrap().same_as(&failure));
}

#[test]
fn test_handler_error() {
    let handler_a = coroutine(|ov: Ctx| async move {
        ov.phase("two").wait().await?;
        ov.log("A2");
        ov.phase("three").wait().await?;
        ov.log("A3");
        Ok(())
    });
    let handler_e = coroutine(|ov: Ctx| async move {
        ov.phase("two").wait().await?;
        anyhow::bail!("boom")
    });
    let handler_b = coroutine(|ov: Ctx| async move {
        ov.phase("two").wait().await?;
        ov.log("B2");
        ov.phase("three").wait().await?;
        ov.log("B3");
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler_a);
    ov.add(&handler_e);
    ov.add(&handler_b);
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&["1", "2", "A2", "B2", "3", "A3", "B3", "4", "5"])
    );
    assert_eq!(ov.errors(), strings(&["boom"]));
}

#[test]
fn test_immediate_handler_error() {
    let ov = LightOverseer::new();
    let handler = eager(|_: Ctx| anyhow::bail!("boom"));
    ov.add(&handler);
    ov.add(&handler);
    ov.run();

    assert_eq!(ov.results(), strings(&["1", "2", "3", "4", "5"]));
    assert_eq!(ov.errors(), strings(&["boom"]));
}

#[test]
fn test_error_before_first_phase() {
    let handler = coroutine(|ov: Ctx| async move {
        ov.log("A0");
        anyhow::bail!("early")
    });

    let ov = LightOverseer::new();
    ov.add(&handler);
    ov.run();

    assert_eq!(ov.results(), strings(&["A0", "1", "2", "3", "4", "5"]));
    assert_eq!(ov.errors(), strings(&["early"]));
}

#[test]
fn test_not_a_coroutine() {
    let ov = LightOverseer::new();
    ov.add(&eager(|ov: Ctx| {
        ov.log("A");
        Ok(())
    }));
    ov.run();

    assert_eq!(ov.results(), strings(&["A", "1", "2", "3", "4", "5"]));
    assert!(ov.errors().is_empty());
}

#[test]
fn test_bad_phase() {
    let ov = LightOverseer::new();
    ov.add(&coroutine(|ov: Ctx| async move {
        ov.phase("one").wait().await?;
        futures::future::pending::<()>().await;
        Ok(())
    }));
    ov.run();

    assert_eq!(ov.errors().len(), 1);
    assert!(ov.errors()[0].contains("must yield a valid phase"));
}

#[test]
fn test_foreign_phase() {
    let other = LightOverseer::new();
    let foreign = other.phase("two");

    let ov = LightOverseer::new();
    let moved = foreign.clone();
    ov.add(&coroutine(move |_: Ctx| {
        let foreign = moved.clone();
        async move {
            foreign.wait().await?;
            Ok(())
        }
    }));
    ov.run();

    assert_eq!(ov.errors().len(), 1);
    assert!(ov.errors()[0].contains("must yield a valid phase"));
    assert_eq!(other.runner.pending(&foreign), 0);
}

#[test]
fn test_nested_advance_rejected() {
    let handler = coroutine(|ov: Ctx| async move {
        ov.phase("one").wait().await?;
        let one = ov.phase("one");
        ov.runner().run_phase(&one, Some(0), None)?;
        Ok(())
    });

    let ov = LightOverseer::new();
    ov.add(&handler);
    ov.run();

    assert_eq!(ov.errors().len(), 1);
    assert!(ov.errors()[0].contains("running to running"));
}

struct Letter(&'static str);

impl Handler<Ctx> for Letter {
    fn invoke(&self, ov: Ctx) -> anyhow::Result<Invocation> {
        let letter = self.0;
        Ok(Invocation::Suspended(Box::pin(async move {
            for (step, name) in PHASES.iter().enumerate() {
                ov.log(format!("{letter}{step}"));
                ov.phase(name).wait().await?;
            }
            ov.log(format!("{letter}4"));
            Ok(())
        })))
    }
}

#[test]
fn test_struct_handler() {
    let ov = LightOverseer::new();
    let a: Rc<dyn Handler<Ctx>> = Rc::new(Letter("A"));
    let b: Rc<dyn Handler<Ctx>> = Rc::new(Letter("B"));
    ov.add(&a);
    ov.add(&b);
    ov.run();

    assert_eq!(
        ov.results(),
        strings(&[
            "A0", "B0", "1", "A1", "B1", "2", "A2", "B2", "3", "A3", "B3", "4", "A4", "B4", "5",
        ])
    );
    assert!(ov.errors().is_empty());
}
