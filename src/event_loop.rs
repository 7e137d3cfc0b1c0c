//! The per-thread cooperative scheduler.
//!
//! An [`EventLoop`] drains its queue in strict priority order: one event is
//! popped and fired at a time, with the event's firing lock held, until the
//! promise being waited on reports ready. When the queue runs dry the loop
//! parks on a condvar-backed signal that other threads poke through
//! [`EventLoop::wake`] (arming an event into an empty queue does this
//! automatically).
//!
//! Exactly one loop is *current* per thread at a time. `wait` saves and
//! restores the thread-local current-loop slot, so an event running on loop
//! A may itself wait on a promise belonging to loop B; re-entering `wait` on
//! the loop that is already draining is a bug and aborts.

use crate::bridge::{make_safe_for, CrossThreadNode};
use crate::exception::{Exception, ExceptionOr};
use crate::node::{ImmediateNode, PromiseNode, TransformNode};
use crate::promise::Promise;
use crate::queue::{Event, EventRef, FireTarget, Queue};
use std::{
    cell::RefCell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
};

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Arc<LoopCore>>> = RefCell::new(None);
}

// sleep/wake signal for an idle loop.
//
// the flag is set while holding the mutex *before* the queue lock is
// released, and `wake` clears it under the same mutex, so an arm that lands
// between the emptiness check and the condvar wait cannot lose its wakeup.
struct SleepSignal {
    prepared: Mutex<bool>,
    cond: Condvar,
}

impl SleepSignal {
    fn new() -> Self {
        SleepSignal { prepared: Mutex::new(false), cond: Condvar::new() }
    }

    // flag the loop as about to sleep. the caller must still hold the queue
    // lock, and must pass the returned guard to `sleep`.
    fn prepare(&self) -> MutexGuard<'_, bool> {
        let mut guard = self.prepared.lock().unwrap();
        *guard = true;
        guard
    }

    fn sleep(&self, mut prepared: MutexGuard<'_, bool>) {
        while *prepared {
            prepared = self.cond.wait(prepared).unwrap();
        }
    }

    fn wake(&self) {
        let mut guard = self.prepared.lock().unwrap();
        if *guard {
            *guard = false;
            self.cond.notify_one();
        }
    }
}

// shared core of an event loop. events and cross-thread publishers keep it
// alive through an Arc even after the owning handle is gone.
pub(crate) struct LoopCore {
    queue: Mutex<Queue>,
    sleep: SleepSignal,
    // true while some thread is inside `wait` on this loop.
    draining: AtomicBool,
}

impl LoopCore {
    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap()
    }

    pub(crate) fn wake_sleeper(&self) {
        self.sleep.wake();
    }
}

/// A single-threaded cooperative event loop.
///
/// Cheap to clone; clones are handles onto the same loop. The loop makes
/// progress only while some thread is inside [`wait`](EventLoop::wait).
#[derive(Clone)]
pub struct EventLoop {
    core: Arc<LoopCore>,
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            core: Arc::new(LoopCore {
                queue: Mutex::new(Queue::new()),
                sleep: SleepSignal::new(),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// The loop whose `wait` the calling thread is currently inside.
    ///
    /// Panics if the thread is not inside any `wait`.
    pub fn current() -> EventLoop {
        Self::try_current().expect("no event loop is draining on this thread")
    }

    pub fn try_current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|slot| slot.borrow().clone().map(|core| EventLoop { core }))
    }

    /// Signal a potentially sleeping loop that new work is available.
    ///
    /// Thread-safe; arming an event does this automatically, so it is only
    /// needed when poking the loop from outside the crate's own machinery.
    pub fn wake(&self) {
        self.core.wake_sleeper();
    }

    /// Drive this loop until `promise` is ready, then return its result.
    ///
    /// A promise pinned to a different loop is transparently re-imported
    /// through a cross-thread node, in which case the owning loop must be
    /// draining on its own thread for progress to happen.
    pub fn wait<T: Send + 'static>(&self, promise: Promise<T>) -> Result<T, Exception> {
        let node = make_safe_for(promise.into_node(), &self.core);
        self.wait_node(node)
    }

    /// Schedule `func` to run from this loop's queue, even if nobody waits
    /// on the returned promise yet. Closures scheduled this way run in
    /// submission order.
    pub fn eval_later<T, F>(&self, func: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let source: Box<dyn PromiseNode<()>> = Box::new(ImmediateNode::from_value(()));
        let transform = TransformNode::boxed(source, None, move |input: ExceptionOr<()>| {
            match input.into_result() {
                Ok(()) => ExceptionOr::from_value(func()),
                Err(e) => ExceptionOr::from_exception(e),
            }
        });
        // the cross-thread node arms itself with yield priority on this
        // loop, which is what makes the evaluation both eager and ordered.
        Promise::from_node(CrossThreadNode::boxed(self.core.clone(), transform))
    }

    pub(crate) fn from_core(core: Arc<LoopCore>) -> Self {
        EventLoop { core }
    }

    pub(crate) fn core(&self) -> &Arc<LoopCore> {
        &self.core
    }

    fn wait_node<T: Send + 'static>(
        &self,
        node: Box<dyn PromiseNode<T>>,
    ) -> Result<T, Exception> {
        let was_draining = self.core.draining.swap(true, Ordering::Acquire);
        assert!(!was_draining, "wait re-entered on a loop that is already draining");
        let _restore = CurrentGuard::enter(self.core.clone());

        let waiter = WaitEvent::new(self.core.clone());
        unsafe { waiter.event.set_target(NonNull::from(&waiter as &dyn FireTarget)) };
        // rebound so it drops ahead of `waiter`: tearing the node down may
        // publish one last time into the waiter's event, which must still
        // be alive (and get disarmed by its own drop) when that happens.
        let mut node = node;

        if node.on_ready(EventRef::new(&waiter.event)) {
            waiter.fired.store(true, Ordering::Relaxed);
        }

        while !waiter.fired.load(Ordering::Relaxed) {
            let mut queue = self.core.lock_queue();
            match queue.pop() {
                Some(event) => unsafe { Queue::fire_popped(queue, event) },
                None => {
                    let prepared = self.core.sleep.prepare();
                    drop(queue);
                    self.core.sleep.sleep(prepared);
                }
            }
        }

        let mut result = ExceptionOr::empty();
        node.get(&mut result);
        drop(node);
        result.into_result()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for EventLoop {}

// saved thread-local state for one `wait` activation.
struct CurrentGuard {
    prev: Option<Arc<LoopCore>>,
    core: Arc<LoopCore>,
}

impl CurrentGuard {
    fn enter(core: Arc<LoopCore>) -> Self {
        let prev = CURRENT_LOOP.with(|slot| slot.borrow_mut().replace(core.clone()));
        CurrentGuard { prev, core }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = self.prev.take());
        self.core.draining.store(false, Ordering::Release);
    }
}

// the stack-allocated event `wait` registers with the node it drives.
struct WaitEvent {
    event: Event,
    fired: AtomicBool,
}

impl WaitEvent {
    fn new(core: Arc<LoopCore>) -> Self {
        let this = WaitEvent { event: Event::new(), fired: AtomicBool::new(false) };
        this.event.pin(core);
        this
    }
}

impl FireTarget for WaitEvent {
    fn fire(&self) {
        self.fired.store(true, Ordering::Relaxed);
    }
}

impl Drop for WaitEvent {
    fn drop(&mut self) {
        self.event.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::promise_and_fulfiller;
    use crate::promise::now;
    use crate::queue::Schedule;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    // an event that logs its name when fired and then arms a batch of other
    // events with preempt priority, as a continuation-heavy fire would.
    struct ArmOnFire {
        event: Event,
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        arm_next: Mutex<Vec<EventRef>>,
    }

    impl ArmOnFire {
        fn boxed(
            core: Arc<LoopCore>,
            name: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
        ) -> Box<Self> {
            let this = Box::new(ArmOnFire {
                event: Event::new(),
                name,
                log,
                arm_next: Mutex::new(Vec::new()),
            });
            this.event.pin(core);
            unsafe { this.event.set_target(NonNull::from(&*this as &dyn FireTarget)) };
            this
        }
    }

    impl FireTarget for ArmOnFire {
        fn fire(&self) {
            self.log.lock().unwrap().push(self.name);
            for event in self.arm_next.lock().unwrap().drain(..) {
                unsafe { event.arm(Schedule::Preempt) };
            }
        }
    }

    #[test]
    fn preempt_arms_run_before_previously_queued_events() {
        let lp = EventLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let e = ArmOnFire::boxed(lp.core().clone(), "e", log.clone());
        let e1 = ArmOnFire::boxed(lp.core().clone(), "e1", log.clone());
        let e2 = ArmOnFire::boxed(lp.core().clone(), "e2", log.clone());
        let q1 = ArmOnFire::boxed(lp.core().clone(), "q1", log.clone());

        *e.arm_next.lock().unwrap() =
            vec![EventRef::new(&e1.event), EventRef::new(&e2.event)];
        e.event.arm(Schedule::Yield);
        q1.event.arm(Schedule::Yield);

        // the eval_later closure is armed behind e and q1, so by the time
        // the wait returns the whole cascade has run.
        lp.wait(lp.eval_later(|| ())).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["e", "e1", "e2", "q1"]);
    }

    #[test]
    fn eval_later_runs_in_submission_order() {
        let lp = EventLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let push = |n: u32| {
            let log = log.clone();
            move || log.lock().unwrap().push(n)
        };
        let _p1 = lp.eval_later(push(1));
        let _p2 = lp.eval_later(push(2));
        let p3 = lp.eval_later(push(3));

        lp.wait(p3).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn eval_later_returns_the_closure_result() {
        let lp = EventLoop::new();
        assert_eq!(lp.wait(lp.eval_later(|| 6 * 7)).unwrap(), 42);
    }

    #[test]
    fn current_is_set_while_draining() {
        assert!(EventLoop::try_current().is_none());
        let lp = EventLoop::new();
        let handle = lp.clone();
        let checked = lp.eval_later(move || {
            assert!(EventLoop::current() == handle);
        });
        lp.wait(checked).unwrap();
        assert!(EventLoop::try_current().is_none());
    }

    #[test]
    fn wait_returns_immediately_for_ready_promises() {
        let lp = EventLoop::new();
        assert_eq!(lp.wait(now(17)).unwrap(), 17);
    }

    // a fire that blocks until told to finish, for exercising the
    // disarm-versus-fire serialization.
    struct SlowFire {
        event: Event,
        started: Arc<AtomicBool>,
        release: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    }

    impl FireTarget for SlowFire {
        fn fire(&self) {
            self.started.store(true, Ordering::Release);
            while !self.release.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            self.done.store(true, Ordering::Release);
        }
    }

    #[test]
    fn disarm_waits_for_a_concurrent_fire() {
        let lp = EventLoop::new();
        let started = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let slow = Box::new(SlowFire {
            event: Event::new(),
            started: started.clone(),
            release: release.clone(),
            done: done.clone(),
        });
        slow.event.pin(lp.core().clone());
        unsafe { slow.event.set_target(NonNull::from(&*slow as &dyn FireTarget)) };
        slow.event.arm(Schedule::Yield);

        let (parked, park_fulfiller) = promise_and_fulfiller::<()>();
        let driver = {
            let lp = lp.clone();
            thread::spawn(move || lp.wait(parked).unwrap())
        };

        while !started.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        let releaser = {
            let release = release.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                release.store(true, Ordering::Release);
            })
        };

        // the fire is in progress; disarm must block until it completes.
        slow.event.disarm();
        assert!(done.load(Ordering::Acquire));

        releaser.join().unwrap();
        park_fulfiller.fulfill(());
        driver.join().unwrap();
    }

    #[test]
    fn reentrant_wait_on_the_same_loop_is_an_error() {
        let lp = EventLoop::new();
        let handle = lp.clone();
        let p = lp.eval_later(move || {
            // the re-entry assertion unwinds out of the nested wait; the
            // transform captures it as a failure of this promise.
            let _ = handle.wait(now(1));
        });
        let error = lp.wait(p).unwrap_err();
        assert_eq!(error.kind(), crate::exception::ExceptionKind::Panicked);
        assert!(error.message().contains("already draining"));
    }

    #[test]
    fn nested_wait_on_a_different_loop_is_allowed() {
        let outer = EventLoop::new();
        let inner = EventLoop::new();
        let count = Arc::new(AtomicU32::new(0));

        let count2 = count.clone();
        let p = outer.eval_later(move || {
            let nested = EventLoop::current();
            assert!(nested != inner);
            count2.fetch_add(inner.wait(now(5)).unwrap(), Ordering::Relaxed);
        });
        outer.wait(p).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
