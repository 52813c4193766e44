use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{CoreError, Result};
use crate::handler::{same_handler, Coroutine, Handler, Invocation};
use crate::phase::{Mailbox, Phase, PhaseFailure};
use crate::state_machine::PhaseStateMachine;
use crate::status::PhaseStatus;

/// Index of the implicit `start` phase, which is always done.
pub const START: usize = 0;

const START_NAME: &str = "start";

/// Receives every error raised by a handler.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error)>;

/// What happens when a resumed handler asks for a phase that is already done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevisitPolicy {
    /// Park the handler on that phase until it is advanced again.
    #[default]
    Park,
    /// Resume the handler right away with the phase's last outcome.
    Replay,
}

struct Suspended {
    priority: i32,
    id: u64,
    coroutine: Coroutine,
    phase: usize,
}

impl PartialEq for Suspended {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for Suspended {}

impl PartialOrd for Suspended {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Suspended {
    // Max-heap: higher priority first, then earlier registration.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

enum Step {
    Finished,
    Suspend { phase: usize, priority: i32 },
}

/// Cooperative scheduler driving handlers through an ordered set of phases.
///
/// Handlers are polled on the calling thread. A handler may call back into
/// the runner (for instance to [`add`](Self::add) another handler) while it
/// is being polled; each phase queue is re-read after every step so such
/// additions are observed within the same advance.
pub struct PhaseRunner<C, V> {
    phases: Vec<Phase<V>>,
    plan: RefCell<Vec<BinaryHeap<Suspended>>>,
    handlers: RefCell<Vec<Rc<dyn Handler<C>>>>,
    context: C,
    error_handler: ErrorHandler,
    mailbox: Rc<Mailbox<V>>,
    next_id: Cell<u64>,
    revisit: RevisitPolicy,
}

impl<C, V> PhaseRunner<C, V>
where
    C: Clone + 'static,
    V: Clone + 'static,
{
    /// Create a runner with `start` followed by `names`, in order.
    pub fn new<I, S>(
        names: I,
        context: C,
        error_handler: impl Fn(anyhow::Error) + 'static,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mailbox = Rc::new(Mailbox::new());
        let mut phases: Vec<Phase<V>> = Vec::new();
        let names = std::iter::once(START_NAME.to_string()).chain(names.into_iter().map(Into::into));
        for name in names {
            if phases.iter().any(|phase| phase.name() == name) {
                return Err(CoreError::DuplicatePhase(name));
            }
            phases.push(Phase::new(phases.len(), name, Rc::clone(&mailbox)));
        }
        phases[START].set_status(PhaseStatus::Done);

        let plan = phases.iter().map(|_| BinaryHeap::new()).collect();

        Ok(Self {
            phases,
            plan: RefCell::new(plan),
            handlers: RefCell::new(Vec::new()),
            context,
            error_handler: Box::new(error_handler),
            mailbox,
            next_id: Cell::new(0),
            revisit: RevisitPolicy::default(),
        })
    }

    pub fn with_revisit(mut self, revisit: RevisitPolicy) -> Self {
        self.revisit = revisit;
        self
    }

    pub fn revisit(&self) -> RevisitPolicy {
        self.revisit
    }

    pub fn phases(&self) -> &[Phase<V>] {
        &self.phases
    }

    pub fn phase(&self, name: &str) -> Option<&Phase<V>> {
        self.phases.iter().find(|phase| phase.name() == name)
    }

    pub fn start(&self) -> &Phase<V> {
        &self.phases[START]
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Number of handlers currently suspended on `phase`.
    pub fn pending(&self, phase: &Phase<V>) -> usize {
        match self.resolve(phase) {
            Some(index) => self.plan.borrow()[index].len(),
            None => 0,
        }
    }

    pub fn is_registered(&self, handler: &Rc<dyn Handler<C>>) -> bool {
        self.handlers
            .borrow()
            .iter()
            .any(|known| same_handler(known, handler))
    }

    /// Register a handler and run it up to its first pending phase.
    ///
    /// A handler that is already registered is ignored. Phases that are
    /// already done are stepped through immediately so that late handlers
    /// catch up with the run.
    pub fn add(&self, handler: &Rc<dyn Handler<C>>) {
        if self.is_registered(handler) {
            return;
        }
        self.handlers.borrow_mut().push(Rc::clone(handler));

        match handler.invoke(self.context.clone()) {
            Err(error) => (self.error_handler)(error),
            Ok(Invocation::Finished) => {}
            Ok(Invocation::Suspended(coroutine)) => {
                let id = self.next_id.get();
                self.next_id.set(id + 1);
                let entry = Suspended {
                    priority: 0,
                    id,
                    coroutine,
                    phase: START,
                };
                self.step(entry, true);
            }
        }
    }

    /// Advance `phase`, resuming every handler waiting on it.
    ///
    /// Handlers receive `exception` if one is given, `value` otherwise.
    pub fn run_phase(
        &self,
        phase: &Phase<V>,
        value: Option<V>,
        exception: Option<PhaseFailure>,
    ) -> Result<()> {
        let index = self
            .resolve(phase)
            .ok_or_else(|| CoreError::UnknownPhase(phase.name().to_string()))?;
        let phase = &self.phases[index];
        PhaseStateMachine::validate_transition(&phase.status(), &PhaseStatus::Running)?;

        tracing::debug!(phase = phase.name(), pending = self.pending(phase), "Running phase");
        phase.begin(value, exception);

        // Stepping may queue more entries here, so pop one at a time.
        while let Some(entry) = self.pop(index) {
            self.step(entry, false);
        }

        PhaseStateMachine::validate_transition(&phase.status(), &PhaseStatus::Done)?;
        phase.set_status(PhaseStatus::Done);
        Ok(())
    }

    fn resolve(&self, phase: &Phase<V>) -> Option<usize> {
        let index = phase.index();
        self.phases
            .get(index)
            .filter(|own| own.same(phase))
            .map(|_| index)
    }

    fn pop(&self, index: usize) -> Option<Suspended> {
        self.plan.borrow_mut()[index].pop()
    }

    fn step(&self, mut entry: Suspended, catching_up: bool) {
        loop {
            match self.step_one(&mut entry.coroutine, entry.phase) {
                Step::Finished => return,
                Step::Suspend { phase, priority } => {
                    entry.phase = phase;
                    entry.priority = priority;
                    if !self.resumes_immediately(phase, catching_up) {
                        break;
                    }
                }
            }
        }
        self.plan.borrow_mut()[entry.phase].push(entry);
    }

    fn resumes_immediately(&self, phase: usize, catching_up: bool) -> bool {
        if !self.phases[phase].is_done() {
            return false;
        }
        phase == START || catching_up || self.revisit == RevisitPolicy::Replay
    }

    fn step_one(&self, coroutine: &mut Coroutine, phase: usize) -> Step {
        let outcome = self.phases[phase].outcome();
        let thrown = outcome.as_ref().err().cloned();

        self.mailbox.reset();
        self.mailbox.deliver(outcome);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let polled = coroutine.as_mut().poll(&mut cx);
        let request = self.mailbox.take_request();
        self.mailbox.reset();

        match polled {
            Poll::Ready(Ok(())) => Step::Finished,
            Poll::Ready(Err(error)) => {
                if !thrown.is_some_and(|failure| failure.is_carried_by(&error)) {
                    (self.error_handler)(error);
                }
                Step::Finished
            }
            Poll::Pending => {
                let resolved = request.and_then(|request| {
                    self.resolve(request.phase())
                        .map(|phase| (phase, request.priority()))
                });
                match resolved {
                    Some((phase, priority)) => Step::Suspend { phase, priority },
                    None => {
                        (self.error_handler)(CoreError::InvalidPhaseRequest.into());
                        Step::Finished
                    }
                }
            }
        }
    }
}
