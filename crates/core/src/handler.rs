use std::future::Future;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

/// A suspended handler body. It completes with `Err` to report a failure,
/// or with the [`crate::PhaseFailure`] it was handed to let it pass through.
pub type Coroutine = LocalBoxFuture<'static, anyhow::Result<()>>;

/// What calling a handler produced.
pub enum Invocation {
    /// The handler ran to completion on the spot.
    Finished,
    /// The handler wants to synchronize on phases.
    Suspended(Coroutine),
}

/// An instrument registered with a [`crate::PhaseRunner`].
///
/// Handlers are keyed by the identity of their `Rc`, so registering the same
/// allocation twice runs it once.
pub trait Handler<C> {
    fn invoke(&self, context: C) -> anyhow::Result<Invocation>;
}

struct CoroutineFn<F>(F);

impl<C, F, Fut> Handler<C> for CoroutineFn<F>
where
    F: Fn(C) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    fn invoke(&self, context: C) -> anyhow::Result<Invocation> {
        Ok(Invocation::Suspended(Box::pin((self.0)(context))))
    }
}

struct EagerFn<F>(F);

impl<C, F> Handler<C> for EagerFn<F>
where
    F: Fn(C) -> anyhow::Result<()>,
{
    fn invoke(&self, context: C) -> anyhow::Result<Invocation> {
        (self.0)(context)?;
        Ok(Invocation::Finished)
    }
}

/// Wrap an async closure as a handler that suspends on phases.
pub fn coroutine<C, F, Fut>(f: F) -> Rc<dyn Handler<C>>
where
    C: 'static,
    F: Fn(C) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    Rc::new(CoroutineFn(f))
}

/// Wrap a plain function as a handler that runs once at registration.
pub fn eager<C, F>(f: F) -> Rc<dyn Handler<C>>
where
    C: 'static,
    F: Fn(C) -> anyhow::Result<()> + 'static,
{
    Rc::new(EagerFn(f))
}

pub(crate) fn same_handler<C>(a: &Rc<dyn Handler<C>>, b: &Rc<dyn Handler<C>>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_eager_runs_immediately() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let handler = eager(move |step: u32| {
            counter.set(counter.get() + step);
            Ok(())
        });

        assert!(matches!(handler.invoke(2).unwrap(), Invocation::Finished));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_eager_error() {
        let handler = eager(|_: ()| anyhow::bail!("boom"));
        let error = handler.invoke(()).err().unwrap();
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn test_coroutine_is_lazy() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let handler = coroutine(move |_: ()| {
            let counter = Rc::clone(&counter);
            async move {
                counter.set(counter.get() + 1);
                Ok(())
            }
        });

        assert!(matches!(handler.invoke(()).unwrap(), Invocation::Suspended(_)));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_identity() {
        let a = eager(|_: ()| Ok(()));
        let b = eager(|_: ()| Ok(()));
        assert!(same_handler(&a, &a.clone()));
        assert!(!same_handler(&a, &b));
    }
}
