// intrusive event queue of an event loop.
//
// the queue is a circular doubly-linked list rooted at a heap-allocated
// sentinel. links live inside the events themselves so that arming and
// disarming are O(1) and allocation-free. all link manipulation happens
// through `Queue` methods, and `Queue` lives inside its loop's queue mutex,
// so holding `&mut Queue` is what makes the raw pointer traffic sound.

use crate::event_loop::LoopCore;
use std::{
    cell::UnsafeCell,
    ptr::{null_mut, NonNull},
    sync::{Arc, Mutex, OnceLock},
};

/// Insertion discipline for arming an event.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Schedule {
    /// Insert before the insert point: runs next, ahead of pre-existing
    /// events. Used by continuations of a just-fired event so that related
    /// events stay grouped and finer event granularity never demotes a
    /// computation behind unrelated work.
    Preempt,
    /// Append at the tail: runs after everything currently queued. Used for
    /// cross-thread hand-off and fork publication so arrivals from other
    /// threads keep a deterministic FIFO order.
    Yield,
}

// something the loop can fire. called on the owner loop's thread with the
// event's firing lock held; implementations use interior mutability and must
// tolerate being fired after their node has been emptied by teardown.
pub(crate) trait FireTarget: Send + Sync {
    fn fire(&self);
}

// list links of an event. guarded by the owning loop's queue mutex.
// `next` is non-null iff the event is armed (the sentinel's links are always
// set and it is never armed in the usual sense).
#[derive(Copy, Clone)]
struct Links {
    next: *mut Event,
    prev: *mut Event,
}

/// One entry in a loop's queue.
///
/// Embedded by value inside whatever owns it (a chain node, a fork hub, the
/// wait loop's stack waiter). The embedding struct must not move while the
/// event is armed, must call [`disarm`](Event::disarm) before dropping it,
/// and must set a fire target before the first arm.
pub(crate) struct Event {
    // the loop this event belongs to. set at most once; events created by
    // combinators with no ambient loop are pinned lazily by the first
    // registration that reaches them.
    core: OnceLock<Arc<LoopCore>>,
    links: UnsafeCell<Links>,
    // held for the duration of `fire`; `disarm` acquires it so that a
    // concurrent fire has completed before disarm returns.
    firing: Mutex<()>,
    target: UnsafeCell<Option<NonNull<dyn FireTarget>>>,
    // true only for a queue's head sentinel, whose links are always set and
    // which is exempt from the armed check on drop.
    sentinel: bool,
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    pub(crate) fn new() -> Self {
        Event {
            core: OnceLock::new(),
            links: UnsafeCell::new(Links { next: null_mut(), prev: null_mut() }),
            firing: Mutex::new(()),
            target: UnsafeCell::new(None),
            sentinel: false,
        }
    }

    // the head sentinel of a queue. never armed, never fired; its links are
    // the root of the circular list.
    fn head_sentinel() -> Self {
        Event {
            core: OnceLock::new(),
            links: UnsafeCell::new(Links { next: null_mut(), prev: null_mut() }),
            firing: Mutex::new(()),
            target: UnsafeCell::new(None),
            sentinel: true,
        }
    }

    // pin this event to a loop. pinning twice to the same loop is a no-op;
    // pinning to a second, different loop is a bug.
    pub(crate) fn pin(&self, core: Arc<LoopCore>) {
        let existing = self.core.get_or_init(|| core.clone());
        assert!(
            Arc::ptr_eq(existing, &core),
            "event is already pinned to a different event loop",
        );
    }

    pub(crate) fn loop_core(&self) -> Option<&Arc<LoopCore>> {
        self.core.get()
    }

    // set what `fire` dispatches to.
    //
    // UB if:
    //
    // - called after the event has ever been armed.
    // - `target` does not outlive every arm/fire of this event.
    pub(crate) unsafe fn set_target(&self, target: NonNull<dyn FireTarget>) {
        *self.target.get() = Some(target);
    }

    // queue the event on its loop, waking the loop if it may be sleeping.
    // no-op if already armed. the event must be pinned and have a target.
    pub(crate) fn arm(&self, schedule: Schedule) {
        let core = self.core.get().expect("event armed before being pinned to a loop");
        let was_empty = {
            let mut queue = core.lock_queue();
            let was_empty = queue.is_empty();
            let inserted = unsafe { queue.arm(self, schedule) };
            was_empty && inserted
        };
        if was_empty {
            core.wake_sleeper();
        }
    }

    // remove the event from its loop's queue (if queued) and wait out any
    // fire currently in progress. after this returns the event is neither
    // queued nor firing and may be dropped.
    pub(crate) fn disarm(&self) {
        let Some(core) = self.core.get() else { return };
        {
            let mut queue = core.lock_queue();
            unsafe { queue.remove(self) };
        }
        drop(self.firing.lock().unwrap());
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // the sentinel's links are permanently set; only ordinary events
        // can be "armed", and owners disarm those in their own teardown. an
        // armed event reaching this point would leave a dangling queue
        // entry behind.
        if self.sentinel {
            return;
        }
        let armed = unsafe { !(*self.links.get()).next.is_null() };
        assert!(
            !armed || std::thread::panicking(),
            "event dropped while armed; its owner must disarm first",
        );
    }
}

// shareable pointer to an event registered somewhere in the promise graph.
//
// validity is by registration contract: the node an event is registered with
// is always owned (directly or transitively) by the event's owner, and is
// dropped before the event is, so a stored EventRef never outlives its event.
#[derive(Copy, Clone)]
pub(crate) struct EventRef(NonNull<Event>);

unsafe impl Send for EventRef {}

impl EventRef {
    pub(crate) fn new(event: &Event) -> Self {
        EventRef(NonNull::from(event))
    }

    // UB if the referenced event is gone.
    pub(crate) unsafe fn arm(self, schedule: Schedule) {
        self.0.as_ref().arm(schedule);
    }

    // loop of the referenced event, if it has been pinned.
    //
    // UB if the referenced event is gone.
    pub(crate) unsafe fn loop_core(self) -> Option<Arc<LoopCore>> {
        self.0.as_ref().loop_core().cloned()
    }

    pub(crate) fn as_ptr(self) -> *mut Event {
        self.0.as_ptr()
    }

    // UB if `ptr` did not come from `EventRef::as_ptr`.
    pub(crate) unsafe fn from_ptr(ptr: *mut Event) -> Self {
        EventRef(NonNull::new_unchecked(ptr))
    }
}

// the lockable queue state. owned by the loop core, inside its queue mutex.
pub(crate) struct Queue {
    // heap sentinel; `head.next` is the front of the queue.
    head: NonNull<Event>,
    // where the next preempt insertion goes: either the sentinel or an
    // event currently in the queue.
    insert_point: NonNull<Event>,
}

unsafe impl Send for Queue {}

impl Queue {
    pub(crate) fn new() -> Self {
        let head = NonNull::from(Box::leak(Box::new(Event::head_sentinel())));
        unsafe {
            *head.as_ref().links.get() =
                Links { next: head.as_ptr(), prev: head.as_ptr() };
        }
        Queue { head, insert_point: head }
    }

    pub(crate) fn is_empty(&self) -> bool {
        unsafe { (*self.head.as_ref().links.get()).next == self.head.as_ptr() }
    }

    unsafe fn links(&self, event: *mut Event) -> *mut Links {
        debug_assert!(!event.is_null());
        (*event).links.get()
    }

    // insert the event per `schedule`, returning whether it was inserted
    // (false if it was already armed).
    //
    // UB if:
    //
    // - the event belongs to a different loop's queue.
    // - the event is freed while armed.
    pub(crate) unsafe fn arm(&mut self, event: &Event, schedule: Schedule) -> bool {
        let ev = event as *const Event as *mut Event;
        let ev_links = self.links(ev);
        if !(*ev_links).next.is_null() {
            return false;
        }

        match schedule {
            Schedule::Preempt => {
                // before the insert point. the insert point itself does not
                // move, so a burst of preempt arms lands in insertion order.
                let next = self.insert_point.as_ptr();
                let prev = (*self.links(next)).prev;
                *ev_links = Links { next, prev };
                (*self.links(prev)).next = ev;
                (*self.links(next)).prev = ev;
            }
            Schedule::Yield => {
                // at the tail, i.e. before the sentinel.
                let next = self.head.as_ptr();
                let prev = (*self.links(next)).prev;
                *ev_links = Links { next, prev };
                (*self.links(prev)).next = ev;
                (*self.links(next)).prev = ev;

                // edge case: queue was fully drained, so the insert point
                // had fallen back to the sentinel. aim it at this event so
                // preempt insertions land ahead of it again.
                if self.insert_point == self.head {
                    self.insert_point = NonNull::new_unchecked(ev);
                }
            }
        }
        true
    }

    // unlink the event if armed, returning whether it was armed.
    //
    // UB if the event is linked into a different queue.
    pub(crate) unsafe fn remove(&mut self, event: &Event) -> bool {
        let ev = event as *const Event as *mut Event;
        let ev_links = self.links(ev);
        if (*ev_links).next.is_null() {
            return false;
        }

        if self.insert_point.as_ptr() == ev {
            self.insert_point = NonNull::new_unchecked((*ev_links).next);
        }

        let Links { next, prev } = *ev_links;
        (*self.links(prev)).next = next;
        (*self.links(next)).prev = prev;
        *ev_links = Links { next: null_mut(), prev: null_mut() };
        true
    }

    // unlink and return the front event, resetting the insert point to the
    // new front so that preempt arms made while it fires group behind it.
    pub(crate) fn pop(&mut self) -> Option<NonNull<Event>> {
        unsafe {
            let first = (*self.head.as_ref().links.get()).next;
            if first == self.head.as_ptr() {
                return None;
            }
            let first_links = self.links(first);
            let next = (*first_links).next;
            (*self.head.as_ref().links.get()).next = next;
            (*self.links(next)).prev = self.head.as_ptr();
            *first_links = Links { next: null_mut(), prev: null_mut() };
            self.insert_point = NonNull::new_unchecked(next);
            Some(NonNull::new_unchecked(first))
        }
    }

    // fire the given just-popped event. the caller must still hold the
    // queue mutex when calling this; the event's firing lock is taken
    // before the queue lock is released so that a disarm racing with the
    // pop cannot free the event out from under the fire.
    //
    // UB if `event` was not just returned by `pop` on this queue.
    pub(crate) unsafe fn fire_popped(
        guard: std::sync::MutexGuard<'_, Queue>,
        event: NonNull<Event>,
    ) {
        let event = event.as_ref();
        let firing = event.firing.lock().unwrap();
        drop(guard);
        let target = (*event.target.get()).expect("queued event has no fire target");
        target.as_ref().fire();
        drop(firing);
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // every armed event is owned elsewhere and must already have been
        // disarmed; only the sentinel is ours to free.
        assert!(
            self.is_empty() || std::thread::panicking(),
            "event queue dropped while events are still armed",
        );
        unsafe { drop(Box::from_raw(self.head.as_ptr())) };
    }
}
