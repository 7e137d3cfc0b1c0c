//! The user-facing promise handle and its combinators.

use crate::chain::ChainNode;
use crate::event_loop::EventLoop;
use crate::exception::{catch, Exception, ExceptionOr};
use crate::fork::{ForkHub, ForkedPromise};
use crate::node::{ImmediateNode, PromiseNode, TransformNode};
use crate::queue::Schedule;

/// An asynchronous value.
///
/// A promise exclusively owns the graph node that will produce its result;
/// combinators consume the promise and move that node into a new one.
/// Dropping a promise cancels the computation it owns: "stop caring" is the
/// only cancellation primitive, and it is always memory-safe.
pub struct Promise<T> {
    node: Box<dyn PromiseNode<T>>,
}

/// A promise that is already fulfilled with `value`.
pub fn now<T: Send + 'static>(value: T) -> Promise<T> {
    Promise::from_node(Box::new(ImmediateNode::from_value(value)))
}

/// A promise that is already broken with a failure carrying `message`.
pub fn broken<T: Send + 'static>(message: &str) -> Promise<T> {
    Promise::from_exception(Exception::failed(message))
}

impl<T: Send + 'static> Promise<T> {
    /// A promise already broken with the given exception.
    pub fn from_exception(exception: Exception) -> Promise<T> {
        Promise::from_node(Box::new(ImmediateNode::from_exception(exception)))
    }

    pub(crate) fn from_node(node: Box<dyn PromiseNode<T>>) -> Promise<T> {
        Promise { node }
    }

    pub(crate) fn into_node(self) -> Box<dyn PromiseNode<T>> {
        self.node
    }

    /// Transform the eventual value with `func`.
    ///
    /// A failure skips `func` and propagates; a panic inside `func` breaks
    /// the resulting promise instead of unwinding through the loop.
    pub fn map<U, F>(self, func: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Promise::from_node(TransformNode::boxed(self.node, None, move |input: ExceptionOr<T>| {
            match input.into_result() {
                Ok(value) => ExceptionOr::from_value(func(value)),
                Err(e) => ExceptionOr::from_exception(e),
            }
        }))
    }

    /// Handle the eventual failure, either recovering with a value or
    /// substituting another exception. A fulfilled promise passes through
    /// untouched.
    pub fn or_else<F>(self, handler: F) -> Promise<T>
    where
        F: FnOnce(Exception) -> Result<T, Exception> + Send + 'static,
    {
        Promise::from_node(TransformNode::boxed(self.node, None, move |input: ExceptionOr<T>| {
            match input.into_result() {
                Ok(value) => ExceptionOr::from_value(value),
                Err(e) => handler(e).into(),
            }
        }))
    }

    /// Chain an asynchronous continuation: `func` returns another promise,
    /// and the result collapses to a single `Promise<U>`.
    ///
    /// The continuation is scheduled on the loop that owns this promise (or
    /// the current loop, or lazily on whichever loop first waits), with
    /// preempt priority so a chain keeps running ahead of unrelated queued
    /// work.
    pub fn then<U, F>(self, func: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let pin = self
            .node
            .safe_loop()
            .or_else(|| EventLoop::try_current().map(|lp| lp.core().clone()));
        let intermediate =
            TransformNode::boxed(self.node, pin.clone(), move |input: ExceptionOr<T>| {
                match input.into_result() {
                    Ok(value) => ExceptionOr::from_value(func(value)),
                    Err(e) => ExceptionOr::from_exception(e),
                }
            });
        Promise::from_node(ChainNode::boxed(
            intermediate,
            pin.map(|core| (core, Schedule::Preempt)),
        ))
    }

    /// Split this promise into a shared source that many consumers can
    /// observe. Requires `T: Clone`, since every branch receives its own
    /// copy of the result.
    pub fn fork(self) -> ForkedPromise<T>
    where
        T: Clone,
    {
        let pin = self
            .node
            .safe_loop()
            .or_else(|| EventLoop::try_current().map(|lp| lp.core().clone()));
        ForkedPromise::new(ForkHub::new(self.node, pin))
    }

    /// Block until the result is available, driving the owning loop.
    ///
    /// Uses the loop this promise is pinned to, falling back to the current
    /// loop and then to a private transient loop. Must not be called from
    /// inside an event of the loop it would drive.
    pub fn wait(self) -> Result<T, Exception> {
        match self.node.safe_loop() {
            Some(core) => EventLoop::from_core(core).wait(self),
            None => match EventLoop::try_current() {
                Some(lp) => lp.wait(self),
                None => EventLoop::new().wait(self),
            },
        }
    }

    /// Discard this promise, swallowing (and debug-logging) anything its
    /// teardown raises, including a pending failure nobody observed.
    pub fn absolve(self) {
        if let Err(e) = catch(move || drop(self.node)) {
            debug!("absolved a promise whose teardown failed: {}", e);
        }
    }
}
