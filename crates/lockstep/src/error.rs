//! Error kinds, cancellation, and the failure-delivery policy.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Errors raised out of [`Scheduler::run`](crate::Scheduler::run) and
/// injected into coroutines during unwinding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A coroutine or a thread-dispatched function raised.
    #[error(transparent)]
    User(UserError),

    /// Injected by the failure controller while unwinding the loop.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    /// A coroutine yielded something the driver cannot act on.
    #[error("invalid yield: {0}")]
    BadYield(String),

    /// The ready queue drained with no timer or thread left to produce a
    /// wake: the remaining coroutines are waiting on each other.
    #[error("deadlock detected: the remaining coroutines can never be woken")]
    Deadlock,

    /// Injected into a coroutine that exceeded its [`timeout`](crate::timeout)
    /// limit.
    #[error("coroutine timed out")]
    Timeout,

    /// Several errors were observed while unwinding; the first is the origin.
    #[error(transparent)]
    Group(ErrorGroup),
}

impl Error {
    /// Wrap an arbitrary user error.
    pub fn user(err: impl StdError + Send + Sync + 'static) -> Self {
        Error::User(UserError::new(err))
    }

    /// The originating failure: for groups, the first member; for
    /// cancellations, the recorded upstream cause; otherwise `self`.
    pub fn origin(&self) -> &Error {
        match self {
            Error::Group(group) => group.origin(),
            Error::Cancelled(cancelled) => match cancelled.origin() {
                Some(origin) => origin.origin(),
                None => self,
            },
            _ => self,
        }
    }

    /// Borrow the underlying user error as `T`, if the origin is a
    /// user-raised error of that type.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        match self.origin() {
            Error::User(user) => user.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

/// An arbitrary error raised by user code.
///
/// The payload is shared so that the cause chains of several cancellation
/// errors can reference one origin without copying it.
#[derive(Clone)]
pub struct UserError(Arc<dyn StdError + Send + Sync>);

impl UserError {
    /// Wrap a user error.
    pub fn new(err: impl StdError + Send + Sync + 'static) -> Self {
        UserError(Arc::new(err))
    }

    /// Borrow the payload as `T`, if it has that type.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl StdError for UserError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Raised inside a coroutine that is being cancelled because another unit of
/// the same loop failed.
///
/// A coroutine receiving this through [`Resume::Fault`](crate::Resume) may
/// perform cleanup yields, but must eventually return the error to
/// acknowledge the cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelledError {
    origin: Option<Arc<Error>>,
}

impl CancelledError {
    /// A cancellation with no recorded cause.
    pub fn new() -> Self {
        CancelledError { origin: None }
    }

    pub(crate) fn with_origin(origin: Arc<Error>) -> Self {
        CancelledError {
            origin: Some(origin),
        }
    }

    /// The failure that triggered this cancellation, if recorded.
    pub fn origin(&self) -> Option<&Error> {
        self.origin.as_deref()
    }
}

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("coroutine cancelled due to an error in another coroutine")
    }
}

impl StdError for CancelledError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.origin
            .as_ref()
            .map(|origin| origin.as_ref() as &(dyn StdError + 'static))
    }
}

/// Aggregate of every error observed while unwinding the loop.
///
/// The origin comes first; the rest are errors raised by other units while
/// they were being cancelled.
#[derive(Debug, Clone)]
pub struct ErrorGroup {
    origin: Arc<Error>,
    siblings: Vec<Error>,
}

impl ErrorGroup {
    pub(crate) fn new(origin: Arc<Error>, siblings: Vec<Error>) -> Self {
        ErrorGroup { origin, siblings }
    }

    /// The first failure observed by the loop.
    pub fn origin(&self) -> &Error {
        &self.origin
    }

    /// Errors raised by other units during shutdown.
    pub fn siblings(&self) -> &[Error] {
        &self.siblings
    }

    /// Total number of collected errors, the origin included.
    pub fn len(&self) -> usize {
        1 + self.siblings.len()
    }

    /// An error group always holds at least the origin.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for ErrorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} errors while running the loop (origin: {})",
            self.len(),
            self.origin
        )
    }
}

impl StdError for ErrorGroup {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.origin.as_ref() as &(dyn StdError + 'static))
    }
}

/// Payload of a panic captured from user code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("panic: {message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        PanicError { message }
    }

    /// The stringified panic payload.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// How [`Scheduler::run_with`](crate::Scheduler::run_with) reports failures
/// when more than one error was observed during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorDelivery {
    /// Return the bare origin when every other unit cancelled cleanly, and an
    /// [`ErrorGroup`] when cleanup raised further errors.
    #[default]
    Single,
    /// Always return an [`ErrorGroup`], including the errors of units that
    /// cancelled cleanly.
    Group,
    /// Always return the bare origin, discarding sibling errors.
    Off,
}
