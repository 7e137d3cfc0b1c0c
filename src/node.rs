// promise node capability set and the leaf/transform variants.
//
// a node is one vertex of the promise graph. the full capability set is
// three operations: register a continuation event, extract the result, and
// report the loop the node is pinned to (if any). combinators own their
// dependencies through `Box<dyn PromiseNode<_>>`, so a dropped promise tears
// down its whole private subgraph.

use crate::event_loop::LoopCore;
use crate::exception::{catch, Exception, ExceptionOr};
use crate::queue::{EventRef, Schedule};
use std::{
    cell::UnsafeCell,
    ptr::null_mut,
    sync::{atomic::AtomicPtr, atomic::Ordering, Arc},
};

/// Internal representation of an asynchronous computation.
pub(crate) trait PromiseNode<T>: Send {
    // register `event` to be armed once this node's result is available.
    // returns true if the node is already ready, in which case the event is
    // not armed and the caller should proceed directly to `get`. callable at
    // most once per node.
    fn on_ready(&mut self, event: EventRef) -> bool;

    // move the result into `output`. only valid after readiness has been
    // observed (an `on_ready` returning true, or the registered event
    // having fired).
    fn get(&mut self, output: &mut ExceptionOr<T>);

    // the loop this node is pinned to, if any. combinators use this to
    // detect cross-loop composition and re-import through a cross-thread
    // node where needed.
    fn safe_loop(&self) -> Option<Arc<LoopCore>> {
        None
    }
}

// ==== atomic on-ready protocol ====

// sentinel distinguishing "result published, no waiter was present" from
// both the empty state (null) and a registered waiter. never dereferenced.
fn already_ready() -> *mut crate::queue::Event {
    1usize as *mut crate::queue::Event
}

// one-word readiness slot shared between a publishing side (possibly on
// another thread) and a single consumer. three states: null (no waiter, not
// ready), a registered waiter event, or the already-ready sentinel.
//
// release/acquire ordering on the exchanges is what lets the consumer read
// the node's result cell without further synchronization once it has
// observed readiness.
pub(crate) struct OnReadySlot(AtomicPtr<crate::queue::Event>);

impl OnReadySlot {
    pub(crate) fn new() -> Self {
        OnReadySlot(AtomicPtr::new(null_mut()))
    }

    // a slot that was published before any waiter could exist.
    pub(crate) fn ready_from_the_start() -> Self {
        OnReadySlot(AtomicPtr::new(already_ready()))
    }

    // register a waiter. returns true if the result is already published
    // (the event is not stored). registering twice is a bug.
    pub(crate) fn on_ready(&self, event: EventRef) -> bool {
        match self.0.compare_exchange(
            null_mut(),
            event.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(observed) => {
                assert!(
                    observed == already_ready(),
                    "on_ready called twice on the same node",
                );
                true
            }
        }
    }

    // publish readiness: if a waiter is registered, arm it with `schedule`;
    // otherwise remember that the result arrived first. publishing twice is
    // a bug.
    pub(crate) fn ready(&self, schedule: Schedule) {
        match self.0.compare_exchange(
            null_mut(),
            already_ready(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(observed) => {
                assert!(observed != already_ready(), "node readiness published twice");
                unsafe { EventRef::from_ptr(observed).arm(schedule) };
            }
        }
    }
}

// ==== publish-once result cell ====

// result storage shared between one publisher and its consumers.
//
// UB unless:
//
// - `publish` is called by exactly one thread, before readiness is made
//   observable through an `OnReadySlot` (or equivalent release operation).
// - readers call `take`/`clone_result` only after observing readiness, and
//   `take` at most once.
pub(crate) struct ResultCell<T>(UnsafeCell<ExceptionOr<T>>);

unsafe impl<T: Send> Send for ResultCell<T> {}
unsafe impl<T: Send> Sync for ResultCell<T> {}

impl<T> ResultCell<T> {
    pub(crate) fn new() -> Self {
        ResultCell(UnsafeCell::new(ExceptionOr::empty()))
    }

    pub(crate) unsafe fn publish(&self) -> &mut ExceptionOr<T> {
        &mut *self.0.get()
    }

    pub(crate) unsafe fn take(&self, output: &mut ExceptionOr<T>) {
        output.adopt(std::mem::replace(&mut *self.0.get(), ExceptionOr::empty()));
    }
}

impl<T: Clone> ResultCell<T> {
    pub(crate) unsafe fn clone_result(&self) -> Result<T, Exception> {
        (*self.0.get()).clone_result()
    }
}

// ==== leaf node ====

// a node that was ready before it was even composed: either a value or a
// pre-constructed failure.
pub(crate) struct ImmediateNode<T> {
    result: ExceptionOr<T>,
}

impl<T> ImmediateNode<T> {
    pub(crate) fn from_value(value: T) -> Self {
        ImmediateNode { result: ExceptionOr::from_value(value) }
    }

    pub(crate) fn from_exception(exception: Exception) -> Self {
        ImmediateNode { result: ExceptionOr::from_exception(exception) }
    }
}

impl<T: Send> PromiseNode<T> for ImmediateNode<T> {
    fn on_ready(&mut self, _event: EventRef) -> bool {
        true
    }

    fn get(&mut self, output: &mut ExceptionOr<T>) {
        output.adopt(std::mem::replace(&mut self.result, ExceptionOr::empty()));
    }
}

// ==== transform node ====

// a single dependency plus a closure over its full result. the facade folds
// its value/error handling into the closure, so one node shape serves both
// the success-arm and failure-arm combinators. the closure and the teardown
// of the dependency both run under panic capture, accumulating into the
// output instead of unwinding through the loop.
pub(crate) struct TransformNode<T, U, F>
where
    F: FnOnce(ExceptionOr<T>) -> ExceptionOr<U>,
{
    dependency: Option<Box<dyn PromiseNode<T>>>,
    func: Option<F>,
    pin: Option<Arc<LoopCore>>,
    _output: std::marker::PhantomData<fn() -> U>,
}

impl<T, U, F> TransformNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(ExceptionOr<T>) -> ExceptionOr<U> + Send + 'static,
{
    pub(crate) fn boxed(
        dependency: Box<dyn PromiseNode<T>>,
        pin: Option<Arc<LoopCore>>,
        func: F,
    ) -> Box<dyn PromiseNode<U>> {
        Box::new(TransformNode {
            dependency: Some(dependency),
            func: Some(func),
            pin,
            _output: std::marker::PhantomData,
        })
    }
}

impl<T, U, F> PromiseNode<U> for TransformNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(ExceptionOr<T>) -> ExceptionOr<U> + Send + 'static,
{
    fn on_ready(&mut self, event: EventRef) -> bool {
        self.dependency
            .as_mut()
            .expect("transform node used after its result was taken")
            .on_ready(event)
    }

    fn get(&mut self, output: &mut ExceptionOr<U>) {
        let mut dependency =
            self.dependency.take().expect("transform node used after its result was taken");
        let mut input = ExceptionOr::empty();
        dependency.get(&mut input);
        if let Err(e) = catch(move || drop(dependency)) {
            input.add_exception(e);
        }

        let func = self.func.take().expect("transform node used after its result was taken");
        match catch(move || func(input)) {
            Ok(transformed) => output.adopt(transformed),
            Err(e) => output.add_exception(e),
        }
    }

    fn safe_loop(&self) -> Option<Arc<LoopCore>> {
        self.pin
            .clone()
            .or_else(|| self.dependency.as_ref().and_then(|d| d.safe_loop()))
    }
}
