use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::status::PhaseStatus;

/// What a suspended handler receives when its phase is advanced.
pub type Outcome<V> = std::result::Result<Option<V>, PhaseFailure>;

/// An error attached to a phase and thrown into every handler waiting on it.
///
/// Clones share the same underlying error, so a handler that propagates the
/// failure it was given (`phase.wait().await?`) can be told apart from one
/// that raised something new.
#[derive(Clone)]
pub struct PhaseFailure(Arc<anyhow::Error>);

impl PhaseFailure {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn same_as(&self, other: &PhaseFailure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether `error` is this very failure, re-raised by a handler.
    pub fn is_carried_by(&self, error: &anyhow::Error) -> bool {
        error
            .downcast_ref::<PhaseFailure>()
            .is_some_and(|carried| carried.same_as(self))
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for PhaseFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        (**self.0).source()
    }
}

struct PhaseState<V> {
    index: usize,
    name: String,
    status: Cell<PhaseStatus>,
    value: RefCell<Option<V>>,
    exception: RefCell<Option<PhaseFailure>>,
}

/// Hand-off slot between a polled handler and the runner polling it.
///
/// Before each poll the runner stores the outcome of the phase being
/// delivered; a [`Wait`] that is resumed takes it, and a [`Wait`] that
/// suspends leaves its request behind for the runner to pick up.
pub(crate) struct Mailbox<V> {
    request: RefCell<Option<PhaseRequest<V>>>,
    delivery: RefCell<Option<Outcome<V>>>,
    conflict: Cell<bool>,
}

impl<V> Mailbox<V> {
    pub(crate) fn new() -> Self {
        Self {
            request: RefCell::new(None),
            delivery: RefCell::new(None),
            conflict: Cell::new(false),
        }
    }

    pub(crate) fn deliver(&self, outcome: Outcome<V>) {
        *self.delivery.borrow_mut() = Some(outcome);
    }

    pub(crate) fn reset(&self) {
        self.request.borrow_mut().take();
        self.delivery.borrow_mut().take();
        self.conflict.set(false);
    }

    /// The single phase requested during the last poll, if exactly one was.
    pub(crate) fn take_request(&self) -> Option<PhaseRequest<V>> {
        let request = self.request.borrow_mut().take();
        if self.conflict.replace(false) {
            return None;
        }
        request
    }

    fn submit(&self, request: PhaseRequest<V>) {
        let mut slot = self.request.borrow_mut();
        if slot.is_some() {
            self.conflict.set(true);
        }
        *slot = Some(request);
    }

    fn take_delivery(&self) -> Option<Outcome<V>> {
        self.delivery.borrow_mut().take()
    }
}

/// A named lifecycle checkpoint owned by a [`crate::PhaseRunner`].
///
/// Cloning yields another handle to the same phase.
pub struct Phase<V> {
    state: Rc<PhaseState<V>>,
    mailbox: Rc<Mailbox<V>>,
}

impl<V> Clone for Phase<V> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            mailbox: Rc::clone(&self.mailbox),
        }
    }
}

impl<V> fmt::Debug for Phase<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.state.name)
            .field("status", &self.state.status.get())
            .finish()
    }
}

impl<V> Phase<V> {
    pub(crate) fn new(index: usize, name: String, mailbox: Rc<Mailbox<V>>) -> Self {
        Self {
            state: Rc::new(PhaseState {
                index,
                name,
                status: Cell::new(PhaseStatus::Pending),
                value: RefCell::new(None),
                exception: RefCell::new(None),
            }),
            mailbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn status(&self) -> PhaseStatus {
        self.state.status.get()
    }

    pub fn is_done(&self) -> bool {
        self.status() == PhaseStatus::Done
    }

    pub fn is_running(&self) -> bool {
        self.status() == PhaseStatus::Running
    }

    /// Exception delivered by the latest pass, if any.
    pub fn exception(&self) -> Option<PhaseFailure> {
        self.state.exception.borrow().clone()
    }

    /// Suspend until this phase is advanced, at default priority.
    pub fn wait(&self) -> PhaseRequest<V> {
        self.at(0)
    }

    /// Suspend until this phase is advanced. Higher priorities resume first.
    pub fn at(&self, priority: i32) -> PhaseRequest<V> {
        PhaseRequest {
            phase: self.clone(),
            priority,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.state.index
    }

    pub(crate) fn same(&self, other: &Phase<V>) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn set_status(&self, status: PhaseStatus) {
        self.state.status.set(status);
    }

    pub(crate) fn begin(&self, value: Option<V>, exception: Option<PhaseFailure>) {
        *self.state.value.borrow_mut() = value;
        *self.state.exception.borrow_mut() = exception;
        self.set_status(PhaseStatus::Running);
    }
}

impl<V: Clone> Phase<V> {
    /// Value delivered by the latest pass, if any.
    pub fn value(&self) -> Option<V> {
        self.state.value.borrow().clone()
    }

    pub(crate) fn outcome(&self) -> Outcome<V> {
        match self.exception() {
            Some(failure) => Err(failure),
            None => Ok(self.value()),
        }
    }
}

/// A phase paired with the priority a handler waits on it with.
pub struct PhaseRequest<V> {
    phase: Phase<V>,
    priority: i32,
}

impl<V> PhaseRequest<V> {
    pub fn phase(&self) -> &Phase<V> {
        &self.phase
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl<V> IntoFuture for PhaseRequest<V> {
    type Output = Outcome<V>;
    type IntoFuture = Wait<V>;

    fn into_future(self) -> Wait<V> {
        let mailbox = Rc::clone(&self.phase.mailbox);
        Wait {
            request: Some(self),
            mailbox,
        }
    }
}

/// Future returned by awaiting a [`PhaseRequest`].
///
/// The first poll hands the request to the runner and suspends; the next
/// poll resumes with whatever the runner delivered for that phase.
pub struct Wait<V> {
    request: Option<PhaseRequest<V>>,
    mailbox: Rc<Mailbox<V>>,
}

impl<V> Future for Wait<V> {
    type Output = Outcome<V>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(request) = this.request.take() {
            this.mailbox.submit(request);
            return Poll::Pending;
        }
        match this.mailbox.take_delivery() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}
