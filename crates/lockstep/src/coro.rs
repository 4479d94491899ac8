//! The coroutine trait, shared handles, and the driver-facing yield protocol.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::event::Wait;
use crate::thread::ThreadJob;
use crate::value::Value;

/// Unique identifier for a coroutine, stable for the life of the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroId(u64);

static NEXT_CORO_ID: AtomicU64 = AtomicU64::new(1);

impl CoroId {
    fn next() -> Self {
        CoroId(NEXT_CORO_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric id, for diagnostics.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Input delivered when a coroutine is resumed.
#[derive(Debug)]
pub enum Resume {
    /// First resumption, or resumption after a bare pause, a background
    /// spawn, or a targeted cancellation of another coroutine.
    Empty,
    /// Result of the single awaited coroutine or thread job.
    Value(Value),
    /// Results of a gather, in the positions the children were yielded.
    List(Vec<Value>),
    /// Outcome of a timed wait: whether the event flag was set when the
    /// coroutine resumed.
    Set(bool),
    /// An injected failure. Return it, possibly after cleanup yields, to
    /// acknowledge the cancellation.
    Fault(Error),
}

/// Output of one resumption step.
#[derive(Debug)]
pub enum Step {
    /// Suspend, handing the driver a classified yield.
    Yield(Yielded),
    /// Finish with a value.
    Done(Value),
}

/// The objects a coroutine may hand to the driver when suspending.
#[derive(Debug)]
pub enum Yielded {
    /// Plain cooperative yield; the coroutine is rescheduled immediately.
    Pause,
    /// Suspend until the given coroutine has a result.
    Await(Coro),
    /// Suspend until every listed coroutine has a result; results are
    /// delivered positionally. Duplicates are allowed and observe the same
    /// result, while the coroutine itself runs once.
    Gather(Vec<Coro>),
    /// Register the given coroutines without awaiting them. The yielder is
    /// resumed immediately with [`Resume::Empty`].
    Spawn(Vec<Coro>),
    /// Suspend until the event is set or the timeout elapses.
    Wait(Wait),
    /// Suspend until the blocking job publishes its result from a worker.
    Job(ThreadJob),
    /// Inject `error` into `target` at its next resumption, removing it from
    /// any wait-set. The yielder is resumed immediately with
    /// [`Resume::Empty`]; the loop itself keeps running.
    Cancel {
        /// The coroutine to fail.
        target: Coro,
        /// The error injected at its suspension point.
        error: Error,
    },
}

impl From<Wait> for Yielded {
    fn from(wait: Wait) -> Self {
        Yielded::Wait(wait)
    }
}

impl From<ThreadJob> for Yielded {
    fn from(job: ThreadJob) -> Self {
        Yielded::Job(job)
    }
}

impl From<Coro> for Yielded {
    fn from(coro: Coro) -> Self {
        Yielded::Await(coro)
    }
}

/// A resumable unit of cooperative work.
///
/// A coroutine is a state machine with two inputs (a value to send, or an
/// error to inject) and one output per step (a classified yield, or the
/// final value). Raising is returning `Err`. A coroutine that never yields
/// is valid and completes on its first resumption.
pub trait Coroutine {
    /// Advance to the next suspension point or to completion.
    fn resume(&mut self, input: Resume) -> Result<Step, Error>;
}

impl<F> Coroutine for F
where
    F: FnMut(Resume) -> Result<Step, Error>,
{
    fn resume(&mut self, input: Resume) -> Result<Step, Error> {
        self(input)
    }
}

struct CoroInner {
    id: CoroId,
    machine: RefCell<Box<dyn Coroutine>>,
    /// Set once the machine has run to completion in some invocation.
    finished: Cell<bool>,
}

/// Shared handle to a coroutine.
///
/// Handles are cheap to clone; every clone refers to the same underlying
/// state machine and result slot, so yielding one handle from several
/// parents expresses a diamond join. A handle whose machine completed in a
/// previous scheduler invocation resolves to [`Value::absent`] when yielded
/// again.
#[derive(Clone)]
pub struct Coro {
    inner: Rc<CoroInner>,
}

impl Coro {
    /// Wrap a state machine.
    pub fn new(machine: impl Coroutine + 'static) -> Self {
        Coro {
            inner: Rc::new(CoroInner {
                id: CoroId::next(),
                machine: RefCell::new(Box::new(machine)),
                finished: Cell::new(false),
            }),
        }
    }

    /// Wrap a closure-shaped state machine.
    pub fn from_fn(f: impl FnMut(Resume) -> Result<Step, Error> + 'static) -> Self {
        Coro::new(f)
    }

    /// A coroutine that completes immediately with `value`.
    pub fn ready(value: Value) -> Self {
        let mut slot = Some(value);
        Coro::from_fn(move |_| Ok(Step::Done(slot.take().unwrap_or_else(Value::absent))))
    }

    /// The stable identity of this coroutine.
    pub fn id(&self) -> CoroId {
        self.inner.id
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.set(true);
    }

    pub(crate) fn resume(&self, input: Resume) -> Result<Step, Error> {
        let mut machine = self.inner.machine.try_borrow_mut().map_err(|_| {
            Error::BadYield("coroutine resumed while it was already running".to_string())
        })?;
        machine.resume(input)
    }
}

impl fmt::Debug for Coro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coro(#{})", self.inner.id.as_u64())
    }
}
