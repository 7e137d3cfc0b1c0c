//! A single-threaded cooperative event loop with a composable promise graph.
//!
//! The model is callbacks over queues, not futures over polls. A
//! [`Promise<T>`] owns the graph node that will eventually produce its
//! result; combinators consume promises and splice their nodes together:
//!
//! - [`Promise::map`] applies a synchronous transformation,
//! - [`Promise::then`] chains a continuation that returns another promise,
//!   collapsing the nesting automatically,
//! - [`Promise::fork`] splits one result out to any number of branches,
//! - [`promise_and_fulfiller`] and [`adapted`] bring results in from other
//!   threads or from non-promise asynchronous APIs.
//!
//! Execution happens on an [`EventLoop`]: a per-thread cooperative
//! scheduler that drains an intrusive queue of events in strict priority
//! order while someone is blocked in [`EventLoop::wait`] (or
//! [`Promise::wait`]). Continuations of a just-fired event are queued ahead
//! of unrelated work, so making a computation more fine-grained never
//! demotes its priority; cross-thread arrivals are appended in FIFO order.
//!
//! Multiple loops on multiple threads coexist. A promise is pinned to at
//! most one loop; results cross between threads only through the
//! cross-thread hand-off machinery, which publishes with release/acquire
//! ordering so a consumer that observes readiness observes the whole
//! result.
//!
//! Failures are values: a broken promise carries an [`Exception`] along the
//! same edges a value would travel, and a panic inside a user continuation
//! is captured into one rather than unwinding through the loop. Dropping a
//! promise is cancellation.
//!
//! ```
//! use millrace::now;
//!
//! let answer = now(5)
//!     .map(|x| x + 1)
//!     .then(|x| now(x * 7))
//!     .wait()
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

mod bridge;
mod chain;
mod event_loop;
mod exception;
mod fork;
mod node;
mod promise;
mod queue;

pub use crate::{
    bridge::{adapted, promise_and_fulfiller, Fulfiller},
    event_loop::EventLoop,
    exception::{Exception, ExceptionKind},
    fork::ForkedPromise,
    promise::{broken, now, Promise},
};
