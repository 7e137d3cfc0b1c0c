// fan-out: one shared hub drives the inner node once, many branches observe
// the published result.
//
// the hub is an event on whichever loop first needs it. its fire follows the
// same two-phase shape as the cross-thread node (ask the inner node, then
// pull and publish), after which it walks an intrusive list of branches and
// publishes into each branch's readiness slot. the list closing out is what
// marks the hub complete; branches added afterwards start out ready.

use crate::event_loop::LoopCore;
use crate::exception::{catch, ExceptionOr};
use crate::node::{OnReadySlot, PromiseNode, ResultCell};
use crate::promise::Promise;
use crate::queue::{Event, EventRef, FireTarget, Schedule};
use std::{
    cell::UnsafeCell,
    ptr::{null_mut, NonNull},
    sync::{Arc, Mutex},
};

pub(crate) struct ForkHub<T> {
    event: Event,
    state: Mutex<HubState<T>>,
    branches: Mutex<BranchList<T>>,
    // written once by `fire`, then read by every branch after it observes
    // readiness through its slot.
    result: ResultCell<T>,
}

struct HubState<T> {
    inner: Option<Box<dyn PromiseNode<T>>>,
    // whether fire already registered with the inner node.
    waiting: bool,
}

// intrusive list of branches still waiting on the hub, plus the hub's
// arming/publication flags. links live inside the branches; everything here
// is guarded by the branches mutex.
struct BranchList<T> {
    first: *mut ForkBranch<T>,
    last: *mut ForkBranch<T>,
    armed: bool,
    // true once the result has been published and the list closed out.
    published: bool,
}

unsafe impl<T: Send> Send for BranchList<T> {}

impl<T: Send + 'static> ForkHub<T> {
    pub(crate) fn new(
        inner: Box<dyn PromiseNode<T>>,
        pin: Option<Arc<LoopCore>>,
    ) -> Arc<ForkHub<T>> {
        let hub = Arc::new(ForkHub {
            event: Event::new(),
            state: Mutex::new(HubState { inner: Some(inner), waiting: false }),
            branches: Mutex::new(BranchList {
                first: null_mut(),
                last: null_mut(),
                armed: false,
                published: false,
            }),
            result: ResultCell::new(),
        });
        unsafe { hub.event.set_target(NonNull::from(&*hub as &dyn FireTarget)) };
        if let Some(core) = pin {
            hub.event.pin(core);
            hub.event.arm(Schedule::Yield);
            hub.branches.lock().unwrap().armed = true;
        }
        hub
    }

    // make sure the hub is queued on some loop. branches call this with the
    // event they are registering, whose loop adopts the hub if no loop was
    // ever determined for it.
    fn ensure_armed(&self, event: &EventRef) {
        let mut list = self.branches.lock().unwrap();
        if !list.armed && !list.published {
            let core = unsafe { event.loop_core() }
                .expect("registering event is not pinned to a loop");
            self.event.pin(core);
            self.event.arm(Schedule::Yield);
            list.armed = true;
        }
    }
}

impl<T: Send + 'static> FireTarget for ForkHub<T> {
    fn fire(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.waiting {
            // teardown emptied the hub while this fire was already queued.
            let Some(inner) = state.inner.as_mut() else { return };
            if !inner.on_ready(EventRef::new(&self.event)) {
                state.waiting = true;
                return;
            }
        }

        let Some(mut inner) = state.inner.take() else { return };
        unsafe {
            let output = self.result.publish();
            inner.get(output);
            if let Err(e) = catch(move || drop(inner)) {
                output.add_exception(e);
            }
        }
        drop(state);

        let mut list = self.branches.lock().unwrap();
        unsafe {
            let mut next = list.first;
            while !next.is_null() {
                let branch = &*next;
                let links = &mut *branch.links.get();
                next = links.next;
                *links = BranchLinks { next: null_mut(), prev: null_mut(), linked: false };
                branch.slot.ready(Schedule::Yield);
            }
        }
        list.first = null_mut();
        list.last = null_mut();
        list.published = true;
    }
}

impl<T> Drop for ForkHub<T> {
    fn drop(&mut self) {
        self.event.disarm();
        let inner = self.state.lock().unwrap().inner.take();
        drop(inner);
        self.event.disarm();
    }
}

// list links of a branch. guarded by the owning hub's branches mutex.
struct BranchLinks<T> {
    next: *mut ForkBranch<T>,
    prev: *mut ForkBranch<T>,
    linked: bool,
}

// one consumer of a hub. holds the hub alive; its readiness slot is what
// the hub publishes into.
pub(crate) struct ForkBranch<T> {
    hub: Option<Arc<ForkHub<T>>>,
    slot: OnReadySlot,
    links: UnsafeCell<BranchLinks<T>>,
}

unsafe impl<T: Send> Send for ForkBranch<T> {}
unsafe impl<T: Send> Sync for ForkBranch<T> {}

impl<T: Send + 'static> ForkBranch<T> {
    pub(crate) fn boxed(hub: &Arc<ForkHub<T>>) -> Box<ForkBranch<T>> {
        let mut list = hub.branches.lock().unwrap();
        let branch = Box::new(ForkBranch {
            hub: Some(hub.clone()),
            // a branch arriving after publication starts out ready.
            slot: if list.published {
                OnReadySlot::ready_from_the_start()
            } else {
                OnReadySlot::new()
            },
            links: UnsafeCell::new(BranchLinks {
                next: null_mut(),
                prev: null_mut(),
                linked: false,
            }),
        });

        if !list.published {
            unsafe {
                let ptr = &*branch as *const ForkBranch<T> as *mut ForkBranch<T>;
                let links = &mut *branch.links.get();
                links.linked = true;
                links.prev = list.last;
                if list.last.is_null() {
                    list.first = ptr;
                } else {
                    (*(*list.last).links.get()).next = ptr;
                }
                list.last = ptr;
            }
        }
        branch
    }
}

impl<T: Clone + Send + 'static> PromiseNode<T> for ForkBranch<T> {
    fn on_ready(&mut self, event: EventRef) -> bool {
        if let Some(hub) = &self.hub {
            hub.ensure_armed(&event);
        }
        self.slot.on_ready(event)
    }

    fn get(&mut self, output: &mut ExceptionOr<T>) {
        let hub = self.hub.take().expect("fork branch read twice");
        unsafe {
            match hub.result.clone_result() {
                Ok(v) => output.set_value(v),
                Err(e) => output.add_exception(e),
            }
        }
        // releasing our share of the hub may tear the whole hub down.
        if let Err(e) = catch(move || drop(hub)) {
            output.add_exception(e);
        }
    }
}

impl<T> Drop for ForkBranch<T> {
    fn drop(&mut self) {
        let Some(hub) = &self.hub else { return };
        let mut list = hub.branches.lock().unwrap();
        unsafe {
            let links = &mut *self.links.get();
            if !links.linked {
                return;
            }
            let ptr = self as *const ForkBranch<T> as *mut ForkBranch<T>;
            if links.prev.is_null() {
                list.first = links.next;
            } else {
                (*(*links.prev).links.get()).next = links.next;
            }
            if links.next.is_null() {
                list.last = links.prev;
            } else {
                (*(*links.next).links.get()).prev = links.prev;
            }
            *links = BranchLinks { next: null_mut(), prev: null_mut(), linked: false };
        }
    }
}

/// The result of [`Promise::fork`]: a shared source that any number of
/// branch promises can be split off from.
pub struct ForkedPromise<T> {
    hub: Arc<ForkHub<T>>,
}

impl<T: Clone + Send + 'static> ForkedPromise<T> {
    pub(crate) fn new(hub: Arc<ForkHub<T>>) -> Self {
        ForkedPromise { hub }
    }

    /// Split off another consumer of the shared result.
    pub fn add_branch(&self) -> Promise<T> {
        Promise::from_node(ForkBranch::boxed(&self.hub))
    }
}
