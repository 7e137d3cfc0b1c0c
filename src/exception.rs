//! Failure values carried through the promise graph.
//!
//! A failed computation produces an [`Exception`], which travels along the
//! graph the same way a value would: a transform whose closure fails produces
//! a broken promise, a chain adopts a broken inner promise, and every branch
//! of a fork observes the same failure. Panics raised by user closures are
//! captured and converted rather than unwinding through the loop.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Broad classification of a failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ExceptionKind {
    /// An explicitly constructed failure (`broken`, `Fulfiller::reject`).
    Failed,
    /// A user closure panicked; the payload was captured as the message.
    Panicked,
    /// The producing side went away without ever publishing a result.
    Abandoned,
}

/// A structured failure value.
///
/// Carries a message, a [`kind`](Self::kind) tag, and optionally the
/// exception that caused this one, forming a cause chain reachable through
/// [`std::error::Error::source`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Exception {
    kind: ExceptionKind,
    message: String,
    #[source]
    cause: Option<Box<Exception>>,
}

impl Exception {
    /// An explicit failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Exception { kind: ExceptionKind::Failed, message: message.into(), cause: None }
    }

    pub(crate) fn abandoned(message: impl Into<String>) -> Self {
        Exception { kind: ExceptionKind::Abandoned, message: message.into(), cause: None }
    }

    /// Attach the exception that caused this one.
    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Exception> {
        self.cause.as_deref()
    }

    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_owned()
        };
        Exception { kind: ExceptionKind::Panicked, message, cause: None }
    }
}

// run user code, converting a panic into an exception so it can flow through
// a result slot instead of unwinding through the event loop.
pub(crate) fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Exception> {
    catch_unwind(AssertUnwindSafe(f)).map_err(Exception::from_panic)
}

/// Either a value, an exception, or nothing yet.
///
/// The internal result slot of every promise node. Filled exactly once by
/// the producing side; `add_exception` keeps the first exception and logs
/// later ones rather than replacing it.
#[derive(Debug)]
pub(crate) struct ExceptionOr<T> {
    value: Option<T>,
    exception: Option<Exception>,
}

impl<T> ExceptionOr<T> {
    pub(crate) fn empty() -> Self {
        ExceptionOr { value: None, exception: None }
    }

    pub(crate) fn from_value(value: T) -> Self {
        ExceptionOr { value: Some(value), exception: None }
    }

    pub(crate) fn from_exception(exception: Exception) -> Self {
        ExceptionOr { value: None, exception: Some(exception) }
    }

    pub(crate) fn set_value(&mut self, value: T) {
        debug_assert!(self.value.is_none(), "result slot filled twice");
        self.value = Some(value);
    }

    pub(crate) fn add_exception(&mut self, exception: Exception) {
        if self.exception.is_none() {
            self.exception = Some(exception);
        } else {
            debug!("discarding secondary exception: {}", exception);
        }
    }

    // move the content of `other` into this slot.
    pub(crate) fn adopt(&mut self, other: ExceptionOr<T>) {
        if let Some(e) = other.exception {
            self.add_exception(e);
        }
        if let Some(v) = other.value {
            self.set_value(v);
        }
    }

    pub(crate) fn into_parts(self) -> (Option<T>, Option<Exception>) {
        (self.value, self.exception)
    }

    // exception wins if both ended up set (a value whose teardown failed).
    pub(crate) fn into_result(self) -> Result<T, Exception> {
        match (self.value, self.exception) {
            (_, Some(e)) => Err(e),
            (Some(v), None) => Ok(v),
            (None, None) => panic!("result slot read while still empty"),
        }
    }
}

impl<T: Clone> ExceptionOr<T> {
    pub(crate) fn clone_result(&self) -> Result<T, Exception> {
        match (&self.value, &self.exception) {
            (_, Some(e)) => Err(e.clone()),
            (Some(v), None) => Ok(v.clone()),
            (None, None) => panic!("result slot read while still empty"),
        }
    }
}

impl<T> From<Result<T, Exception>> for ExceptionOr<T> {
    fn from(result: Result<T, Exception>) -> Self {
        match result {
            Ok(v) => ExceptionOr::from_value(v),
            Err(e) => ExceptionOr::from_exception(e),
        }
    }
}
