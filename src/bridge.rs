// bridging a result across threads: the cross-thread node, the
// promise/fulfiller pair, and the generic adapter constructor.
//
// everything here publishes readiness through the atomic on-ready slot, so
// the producing side may live on any thread. the cross-thread node is also
// the crate's "run this eagerly" primitive: arming it with yield priority on
// a loop forces the dependency to be evaluated from that loop's queue even
// before anyone waits.

use crate::event_loop::LoopCore;
use crate::exception::{catch, Exception, ExceptionOr};
use crate::node::{OnReadySlot, PromiseNode, ResultCell};
use crate::promise::Promise;
use crate::queue::{Event, EventRef, FireTarget, Schedule};
use std::{
    any::Any,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

// ==== cross-thread node ====

// imports a node owned by one loop into consumers anywhere else. the event
// is armed on the loop that owns the dependency, so all registrations
// against the dependency happen on that loop's thread; only the published
// result crosses threads.
pub(crate) struct CrossThreadNode<T> {
    event: Event,
    state: Mutex<BridgeState<T>>,
    slot: OnReadySlot,
    result: ResultCell<T>,
}

struct BridgeState<T> {
    dependency: Option<Box<dyn PromiseNode<T>>>,
    // whether fire already registered with the dependency.
    waiting: bool,
}

impl<T: Send + 'static> CrossThreadNode<T> {
    // `core` must be the loop the dependency is safe on (any loop, for an
    // unpinned dependency).
    pub(crate) fn boxed(
        core: Arc<LoopCore>,
        dependency: Box<dyn PromiseNode<T>>,
    ) -> Box<dyn PromiseNode<T>> {
        let this = Box::new(CrossThreadNode {
            event: Event::new(),
            state: Mutex::new(BridgeState { dependency: Some(dependency), waiting: false }),
            slot: OnReadySlot::new(),
            result: ResultCell::new(),
        });
        unsafe { this.event.set_target(NonNull::from(&*this as &dyn FireTarget)) };
        this.event.pin(core);
        // yield, so that hand-offs queued onto one loop in sequence keep
        // their order.
        this.event.arm(Schedule::Yield);
        this
    }
}

impl<T: Send + 'static> FireTarget for CrossThreadNode<T> {
    fn fire(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.waiting {
            // teardown emptied the node while this fire was already queued.
            let Some(dependency) = state.dependency.as_mut() else { return };
            if !dependency.on_ready(EventRef::new(&self.event)) {
                state.waiting = true;
                return;
            }
        }

        let Some(mut dependency) = state.dependency.take() else { return };
        unsafe {
            let output = self.result.publish();
            dependency.get(output);
            if let Err(e) = catch(move || drop(dependency)) {
                output.add_exception(e);
            }
        }
        drop(state);
        self.slot.ready(Schedule::Yield);
    }
}

impl<T: Send + 'static> PromiseNode<T> for CrossThreadNode<T> {
    fn on_ready(&mut self, event: EventRef) -> bool {
        self.slot.on_ready(event)
    }

    fn get(&mut self, output: &mut ExceptionOr<T>) {
        unsafe { self.result.take(output) };
    }

    // the published result is free-standing, so consumers on any loop are
    // fine.
    fn safe_loop(&self) -> Option<Arc<LoopCore>> {
        None
    }
}

impl<T> Drop for CrossThreadNode<T> {
    fn drop(&mut self) {
        self.event.disarm();
        let dependency = self.state.lock().unwrap().dependency.take();
        drop(dependency);
        self.event.disarm();
    }
}

// wrap `node` so it can be consumed from `core`'s thread, if it is pinned
// to some other loop.
pub(crate) fn make_safe_for<T: Send + 'static>(
    node: Box<dyn PromiseNode<T>>,
    core: &Arc<LoopCore>,
) -> Box<dyn PromiseNode<T>> {
    match node.safe_loop() {
        Some(owner) if !Arc::ptr_eq(&owner, core) => CrossThreadNode::boxed(owner, node),
        _ => node,
    }
}

// ==== fulfiller ====

struct FulfillerShared<T> {
    inner: Mutex<FulfillerInner>,
    slot: OnReadySlot,
    result: ResultCell<T>,
}

struct FulfillerInner {
    // false once the consuming promise has been dropped.
    attached: bool,
    // true once a result has been published.
    filled: bool,
}

impl<T: Send> FulfillerShared<T> {
    fn publish(&self, result: ExceptionOr<T>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.attached || inner.filled {
            debug!("discarding a fulfillment nobody can observe");
            return;
        }
        inner.filled = true;
        unsafe { self.result.publish().adopt(result) };
        // published while still holding the lock: the consuming node
        // detaches under the same lock before it is freed, so any waiter
        // event held by the slot is still alive here.
        self.slot.ready(Schedule::Preempt);
    }
}

/// Sender endpoint of [`promise_and_fulfiller`], usable from any thread.
///
/// Consumed by [`fulfill`](Fulfiller::fulfill) or
/// [`reject`](Fulfiller::reject); dropping it unused rejects the promise
/// with an [`Abandoned`](crate::ExceptionKind::Abandoned) exception.
pub struct Fulfiller<T: Send + 'static> {
    shared: Arc<FulfillerShared<T>>,
    resolved: bool,
}

impl<T: Send + 'static> Fulfiller<T> {
    /// Fulfill the promise with a value.
    pub fn fulfill(self, value: T) {
        self.resolve(ExceptionOr::from_value(value));
    }

    /// Reject the promise with an exception.
    pub fn reject(self, exception: Exception) {
        self.resolve(ExceptionOr::from_exception(exception));
    }

    /// Whether the result could still be observed by anyone: false once the
    /// promise side has been dropped.
    pub fn is_waiting(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.attached && !inner.filled
    }

    fn resolve(mut self, result: ExceptionOr<T>) {
        self.resolved = true;
        self.shared.publish(result);
    }
}

impl<T: Send + 'static> Drop for Fulfiller<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared.publish(ExceptionOr::from_exception(Exception::abandoned(
                "fulfiller dropped before fulfilling its promise",
            )));
        }
    }
}

// the promise-side node of a fulfiller pair. optionally owns an adapter
// value whose drop doubles as the cancellation hook.
struct FulfillerNode<T: Send + 'static> {
    shared: Arc<FulfillerShared<T>>,
    // owned purely so that dropping the promise drops the adapter.
    _adapter: Option<Box<dyn Any + Send>>,
}

impl<T: Send + 'static> PromiseNode<T> for FulfillerNode<T> {
    fn on_ready(&mut self, event: EventRef) -> bool {
        self.shared.slot.on_ready(event)
    }

    fn get(&mut self, output: &mut ExceptionOr<T>) {
        unsafe { self.shared.result.take(output) };
    }
}

impl<T: Send + 'static> Drop for FulfillerNode<T> {
    fn drop(&mut self) {
        // detach before the adapter drops: a cancellation path that tries
        // to fulfill from inside the adapter's teardown must find nobody
        // listening rather than a half-dead node.
        self.shared.inner.lock().unwrap().attached = false;
    }
}

fn new_shared<T: Send + 'static>() -> Arc<FulfillerShared<T>> {
    Arc::new(FulfillerShared {
        inner: Mutex::new(FulfillerInner { attached: true, filled: false }),
        slot: OnReadySlot::new(),
        result: ResultCell::new(),
    })
}

/// A promise plus a thread-safe handle that fulfills it.
pub fn promise_and_fulfiller<T: Send + 'static>() -> (Promise<T>, Fulfiller<T>) {
    let shared = new_shared::<T>();
    let node = Box::new(FulfillerNode { shared: shared.clone(), _adapter: None });
    (Promise::from_node(node), Fulfiller { shared, resolved: false })
}

/// Adapt a non-promise asynchronous operation.
///
/// `build` receives the fulfiller and returns whatever state the operation
/// needs to stay alive; that state is owned by the returned promise and
/// dropped with it, which is the place to cancel the underlying operation.
pub fn adapted<T, A, F>(build: F) -> Promise<T>
where
    T: Send + 'static,
    A: Send + 'static,
    F: FnOnce(Fulfiller<T>) -> A,
{
    let shared = new_shared::<T>();
    let fulfiller = Fulfiller { shared: shared.clone(), resolved: false };
    let adapter = build(fulfiller);
    let node = Box::new(FulfillerNode { shared, _adapter: Some(Box::new(adapter)) });
    Promise::from_node(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainNode;
    use crate::event_loop::EventLoop;
    use crate::exception::ExceptionKind;
    use crate::node::{ImmediateNode, TransformNode};
    use crate::promise::now;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fulfillment_from_another_thread_wakes_the_waiter() {
        let lp = EventLoop::new();
        let (promise, fulfiller) = promise_and_fulfiller::<i32>();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fulfiller.fulfill(42);
        });
        assert_eq!(lp.wait(promise).unwrap(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn fulfillment_before_the_wait_is_observed() {
        let lp = EventLoop::new();
        let (promise, fulfiller) = promise_and_fulfiller::<i32>();
        fulfiller.fulfill(7);
        assert_eq!(lp.wait(promise).unwrap(), 7);
    }

    #[test]
    fn rejection_surfaces_as_the_given_exception() {
        let lp = EventLoop::new();
        let (promise, fulfiller) = promise_and_fulfiller::<i32>();
        fulfiller.reject(Exception::failed("no dice"));
        let error = lp.wait(promise).unwrap_err();
        assert_eq!(error.kind(), ExceptionKind::Failed);
        assert_eq!(error.message(), "no dice");
    }

    #[test]
    fn dropping_the_fulfiller_rejects_the_promise() {
        let lp = EventLoop::new();
        let (promise, fulfiller) = promise_and_fulfiller::<i32>();
        drop(fulfiller);
        let error = lp.wait(promise).unwrap_err();
        assert_eq!(error.kind(), ExceptionKind::Abandoned);
    }

    #[test]
    fn is_waiting_tracks_both_sides() {
        let (promise, fulfiller) = promise_and_fulfiller::<i32>();
        assert!(fulfiller.is_waiting());
        drop(promise);
        assert!(!fulfiller.is_waiting());
        // fulfilling now is a quiet no-op.
        fulfiller.fulfill(1);

        let (promise, fulfiller) = promise_and_fulfiller::<i32>();
        let lp = EventLoop::new();
        fulfiller.fulfill(2);
        assert_eq!(lp.wait(promise).unwrap(), 2);
    }

    struct CancelFlag(Arc<AtomicBool>);
    impl Drop for CancelFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    #[test]
    fn dropping_an_adapted_promise_drops_the_adapter() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let promise = adapted::<i32, _, _>(|fulfiller| {
            (fulfiller, CancelFlag(cancelled.clone()))
        });
        assert!(!cancelled.load(Ordering::Acquire));
        drop(promise);
        assert!(cancelled.load(Ordering::Acquire));
    }

    #[test]
    fn adapted_operations_fulfill_from_their_own_thread() {
        let lp = EventLoop::new();
        let promise = adapted::<i32, _, _>(|fulfiller| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                fulfiller.fulfill(99);
            })
        });
        assert_eq!(lp.wait(promise).unwrap(), 99);
    }

    #[test]
    fn a_foreign_loops_promise_is_reimported_for_wait() {
        let lb = EventLoop::new();

        // a chain pinned to lb, resolving to 8 once lb drains.
        let source: Box<dyn PromiseNode<i32>> = Box::new(ImmediateNode::from_value(4));
        let inner = TransformNode::boxed(source, None, |input: ExceptionOr<i32>| {
            match input.into_result() {
                Ok(v) => ExceptionOr::from_value(now(v * 2)),
                Err(e) => ExceptionOr::from_exception(e),
            }
        });
        let pinned = Promise::from_node(ChainNode::boxed(
            inner,
            Some((lb.core().clone(), Schedule::Yield)),
        ));

        // park lb's owner thread inside wait so it drains its queue.
        let (park, park_fulfiller) = promise_and_fulfiller::<()>();
        let driver = {
            let lb = lb.clone();
            thread::spawn(move || lb.wait(park).unwrap())
        };

        let la = EventLoop::new();
        assert_eq!(la.wait(pinned).unwrap(), 8);

        park_fulfiller.fulfill(());
        driver.join().unwrap();
    }

    #[test]
    fn results_produced_on_one_loop_flow_to_another() {
        let lb = EventLoop::new();
        let derived = lb.eval_later(|| 21).map(|v| v * 2);

        let (park, park_fulfiller) = promise_and_fulfiller::<()>();
        let driver = {
            let lb = lb.clone();
            thread::spawn(move || lb.wait(park).unwrap())
        };

        let la = EventLoop::new();
        assert_eq!(la.wait(derived).unwrap(), 42);

        park_fulfiller.fulfill(());
        driver.join().unwrap();
    }
}
