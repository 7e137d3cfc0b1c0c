// the chain node: collapses Promise<Promise<T>> one level.
//
// a three-state machine driven from its loop's queue. the first fire asks
// the inner node for readiness (PRE_STEP1); once the inner node is ready the
// second fire (or the first, if the inner node was already ready) reads the
// intermediate result, adopts the promise it contains as the new inner node,
// and moves to STEP2 (STEP1 is the armed-and-waiting state in between). from
// STEP2 on, the chain is a transparent shim in front of the adopted node.

use crate::bridge::make_safe_for;
use crate::exception::{catch, ExceptionOr};
use crate::node::{ImmediateNode, PromiseNode};
use crate::promise::Promise;
use crate::queue::{Event, EventRef, FireTarget, Schedule};
use crate::event_loop::LoopCore;
use std::{mem, ptr::NonNull, sync::{Arc, Mutex}};

pub(crate) struct ChainNode<T> {
    event: Event,
    inner: Mutex<ChainInner<T>>,
}

struct ChainInner<T> {
    state: ChainState<T>,
    // continuation registered while the chain had not yet resolved; moved
    // into the adopted node on resolution.
    waiter: Option<EventRef>,
    armed: bool,
}

enum ChainState<T> {
    // armed but not yet fired; the inner node has not been asked anything.
    PreStep1(Box<dyn PromiseNode<Promise<T>>>),
    // fired once; waiting for the inner node to re-arm us.
    Step1(Box<dyn PromiseNode<Promise<T>>>),
    // resolved; holds the adopted node.
    Step2(Box<dyn PromiseNode<T>>),
    // emptied by teardown (or mid-transition).
    Drained,
}

impl<T: Send + 'static> ChainNode<T> {
    // `pin`: loop and schedule to arm with right away. combinators pass
    // None when no loop is determinable yet, in which case the chain pins
    // itself to the loop of the first event registered against it.
    pub(crate) fn boxed(
        inner: Box<dyn PromiseNode<Promise<T>>>,
        pin: Option<(Arc<LoopCore>, Schedule)>,
    ) -> Box<dyn PromiseNode<T>> {
        let this = Box::new(ChainNode {
            event: Event::new(),
            inner: Mutex::new(ChainInner {
                state: ChainState::PreStep1(inner),
                waiter: None,
                armed: false,
            }),
        });
        unsafe { this.event.set_target(NonNull::from(&*this as &dyn FireTarget)) };
        if let Some((core, schedule)) = pin {
            this.event.pin(core);
            this.event.arm(schedule);
            this.inner.lock().unwrap().armed = true;
        }
        this
    }
}

impl<T: Send + 'static> FireTarget for ChainNode<T> {
    fn fire(&self) {
        let mut guard = self.inner.lock().unwrap();

        if matches!(guard.state, ChainState::PreStep1(_)) {
            let self_ref = EventRef::new(&self.event);
            let ready = match &mut guard.state {
                ChainState::PreStep1(inner) => inner.on_ready(self_ref),
                _ => unreachable!(),
            };
            if !ready {
                let ChainState::PreStep1(inner) =
                    mem::replace(&mut guard.state, ChainState::Drained)
                else {
                    unreachable!()
                };
                guard.state = ChainState::Step1(inner);
                return;
            }
        }

        let mut inner = match mem::replace(&mut guard.state, ChainState::Drained) {
            ChainState::PreStep1(inner) | ChainState::Step1(inner) => inner,
            ChainState::Step2(_) => panic!("chain event fired after resolution"),
            // teardown emptied the node while this fire was already queued.
            ChainState::Drained => return,
        };

        let mut intermediate = ExceptionOr::<Promise<T>>::empty();
        inner.get(&mut intermediate);
        if let Err(e) = catch(move || drop(inner)) {
            intermediate.add_exception(e);
        }

        let (value, exception) = intermediate.into_parts();
        let mut adopted: Box<dyn PromiseNode<T>> = if let Some(e) = exception {
            if let Some(stale) = value {
                if let Err(e2) = catch(move || drop(stale)) {
                    debug!("discarding teardown failure of a superseded value: {}", e2);
                }
            }
            Box::new(ImmediateNode::from_exception(e))
        } else if let Some(promise) = value {
            // the closure may have produced a promise living on another
            // loop; re-import it so our registrations stay on our loop.
            let node = promise.into_node();
            match self.event.loop_core() {
                Some(core) => make_safe_for(node, core),
                None => node,
            }
        } else {
            panic!("inner node produced an empty result");
        };

        if let Some(waiter) = guard.waiter.take() {
            if adopted.on_ready(waiter) {
                unsafe { waiter.arm(Schedule::Preempt) };
            }
        }
        guard.state = ChainState::Step2(adopted);
    }
}

impl<T: Send + 'static> PromiseNode<T> for ChainNode<T> {
    fn on_ready(&mut self, event: EventRef) -> bool {
        let mut guard = self.inner.lock().unwrap();
        match &mut guard.state {
            ChainState::PreStep1(_) | ChainState::Step1(_) => {
                assert!(guard.waiter.is_none(), "on_ready called twice on the same node");
                if !guard.armed {
                    let core = unsafe { event.loop_core() }
                        .expect("registering event is not pinned to a loop");
                    self.event.pin(core);
                    self.event.arm(Schedule::Preempt);
                    guard.armed = true;
                }
                guard.waiter = Some(event);
                false
            }
            ChainState::Step2(inner) => inner.on_ready(event),
            ChainState::Drained => panic!("chain node used after teardown"),
        }
    }

    fn get(&mut self, output: &mut ExceptionOr<T>) {
        let mut guard = self.inner.lock().unwrap();
        match &mut guard.state {
            ChainState::Step2(inner) => inner.get(output),
            _ => panic!("chain node read before resolution"),
        }
    }

    fn safe_loop(&self) -> Option<Arc<LoopCore>> {
        self.event.loop_core().cloned()
    }
}

impl<T> Drop for ChainNode<T> {
    fn drop(&mut self) {
        // disarm, tear down the inner node (whose own teardown may publish
        // one last time and re-arm us), then disarm whatever that left.
        self.event.disarm();
        let state = mem::replace(&mut self.inner.lock().unwrap().state, ChainState::Drained);
        drop(state);
        self.event.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::promise_and_fulfiller;
    use crate::event_loop::EventLoop;
    use crate::node::TransformNode;
    use crate::promise::now;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag {
        event: Event,
        fired: AtomicBool,
    }

    impl Flag {
        fn boxed(lp: &EventLoop) -> Box<Self> {
            let this = Box::new(Flag { event: Event::new(), fired: AtomicBool::new(false) });
            this.event.pin(lp.core().clone());
            unsafe { this.event.set_target(NonNull::from(&*this as &dyn FireTarget)) };
            this
        }
    }

    impl FireTarget for Flag {
        fn fire(&self) {
            self.fired.store(true, Ordering::Relaxed);
        }
    }

    fn pending_chain() -> (Box<dyn PromiseNode<i32>>, crate::bridge::Fulfiller<i32>) {
        let (p, f) = promise_and_fulfiller::<i32>();
        let inner = TransformNode::boxed(p.into_node(), None, |input: ExceptionOr<i32>| {
            match input.into_result() {
                Ok(v) => ExceptionOr::from_value(now(v)),
                Err(e) => ExceptionOr::from_exception(e),
            }
        });
        (ChainNode::boxed(inner, None), f)
    }

    #[test]
    #[should_panic(expected = "on_ready called twice")]
    fn second_registration_is_fatal() {
        let lp = EventLoop::new();
        let a = Flag::boxed(&lp);
        let b = Flag::boxed(&lp);
        let (mut chain, _f) = pending_chain();

        assert!(!chain.on_ready(EventRef::new(&a.event)));
        chain.on_ready(EventRef::new(&b.event));
    }

    #[test]
    fn unresolved_chain_reports_its_pin() {
        let lp = EventLoop::new();
        let a = Flag::boxed(&lp);
        let (mut chain, _f) = pending_chain();

        assert!(chain.safe_loop().is_none());
        assert!(!chain.on_ready(EventRef::new(&a.event)));
        // the registration lazily pinned the chain to the event's loop.
        assert!(Arc::ptr_eq(&chain.safe_loop().unwrap(), lp.core()));
    }

    #[test]
    fn dropping_an_unresolved_chain_cancels_cleanly() {
        let lp = EventLoop::new();
        let a = Flag::boxed(&lp);
        let (mut chain, f) = pending_chain();
        assert!(!chain.on_ready(EventRef::new(&a.event)));
        drop(chain);
        assert!(!f.is_waiting());
    }
}
