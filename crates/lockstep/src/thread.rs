//! Thread-run bridge: dispatching blocking functions to worker threads.
//!
//! Blocking work cannot be preempted. The driver asks a running job to stop
//! by raising its advisory [`CancelToken`]; the worker runs to completion
//! either way, and a result published after cancellation is discarded.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::coro::{Coro, CoroId, Resume, Step, Yielded};
use crate::error::{Error, PanicError};
use crate::scheduler::wake::WakeSignal;
use crate::sync::{Permit, Semaphore};
use crate::value::Value;

/// What a worker publishes into the job slot.
pub(crate) type JobOutcome = Result<Box<dyn Any + Send>, Error>;

type JobFn = Box<dyn FnOnce(&CancelToken) -> JobOutcome + Send>;

/// State shared between the driver and the worker running one job.
///
/// The worker owns the slot until it publishes; ownership passes to the
/// driver once the wake signal is observed.
struct JobShared {
    slot: Mutex<Option<JobOutcome>>,
    cancel: AtomicBool,
}

/// Advisory cancellation flag handed to thread-dispatched functions.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<JobShared>,
}

impl CancelToken {
    /// Whether the loop has asked this job to stop.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }
}

/// Handle for a blocking function dispatched to the worker pool.
///
/// Yield it to suspend the parent coroutine until the call completes on a
/// worker thread.
pub struct ThreadJob {
    shared: Arc<JobShared>,
    func: Option<JobFn>,
}

impl std::fmt::Debug for ThreadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadJob").finish_non_exhaustive()
    }
}

impl ThreadJob {
    fn from_fn(f: impl FnOnce(&CancelToken) -> JobOutcome + Send + 'static) -> Self {
        ThreadJob {
            shared: Arc::new(JobShared {
                slot: Mutex::new(None),
                cancel: AtomicBool::new(false),
            }),
            func: Some(Box::new(f)),
        }
    }

    pub(crate) fn into_parts(mut self) -> (Option<JobFn>, Arc<JobShared>) {
        (self.func.take(), self.shared)
    }
}

/// Dispatch a blocking function to the worker pool.
///
/// The returned value becomes the parent's resume input. A panic in `f` is
/// captured and published as a user error.
pub fn run_in_thread<T, F>(f: F) -> ThreadJob
where
    T: Any + Send,
    F: FnOnce() -> T + Send + 'static,
{
    ThreadJob::from_fn(move |_| Ok(Box::new(f()) as Box<dyn Any + Send>))
}

/// Dispatch a blocking function whose `Err` should fail the loop.
pub fn try_run_in_thread<T, E, F>(f: F) -> ThreadJob
where
    T: Any + Send,
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    ThreadJob::from_fn(move |_| match f() {
        Ok(value) => Ok(Box::new(value) as Box<dyn Any + Send>),
        Err(err) => Err(Error::user(err)),
    })
}

/// Dispatch a blocking function that polls its [`CancelToken`] so shutdown
/// can reach it before the work would otherwise finish.
pub fn run_in_thread_cancellable<T, F>(f: F) -> ThreadJob
where
    T: Any + Send,
    F: FnOnce(&CancelToken) -> T + Send + 'static,
{
    ThreadJob::from_fn(move |token| Ok(Box::new(f(token)) as Box<dyn Any + Send>))
}

/// A job handed to the pool; the driver keeps the returned handle to deliver
/// cancellation and collect the outcome.
pub(crate) struct DispatchedJob {
    shared: Arc<JobShared>,
}

impl DispatchedJob {
    pub fn request_cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }

    pub fn take_outcome(&self) -> Option<JobOutcome> {
        self.shared.slot.lock().take()
    }
}

/// Work sent from the driver to a worker.
struct Dispatch {
    parent: CoroId,
    func: JobFn,
    shared: Arc<JobShared>,
}

/// Unbounded pool of reusable worker threads.
///
/// Every dispatched job runs concurrently: the pool keeps at least one
/// worker per outstanding job, so a job is never queued behind a blocking
/// call. Workers park on the dispatch channel between jobs and exit when the
/// pool is dropped and the channel closes.
pub(crate) struct WorkerPool {
    dispatch_tx: Sender<Dispatch>,
    dispatch_rx: Receiver<Dispatch>,
    done_tx: Sender<CoroId>,
    done_rx: Receiver<CoroId>,
    wake: Arc<WakeSignal>,
    /// Jobs dispatched but not yet swept. Driver-side accounting: the pool
    /// is owned by the single driver thread.
    in_flight: Cell<usize>,
    spawned: Cell<usize>,
}

impl WorkerPool {
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        let (dispatch_tx, dispatch_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();
        WorkerPool {
            dispatch_tx,
            dispatch_rx,
            done_tx,
            done_rx,
            wake,
            in_flight: Cell::new(0),
            spawned: Cell::new(0),
        }
    }

    /// Hand a job to a worker, growing the pool so no job waits behind
    /// another.
    pub fn dispatch(&self, parent: CoroId, job: ThreadJob) -> DispatchedJob {
        let (func, shared) = job.into_parts();
        let func = func.expect("thread job dispatched twice");
        self.in_flight.set(self.in_flight.get() + 1);
        if self.in_flight.get() > self.spawned.get() {
            self.spawn_worker();
        }
        self.dispatch_tx
            .send(Dispatch {
                parent,
                func,
                shared: shared.clone(),
            })
            .expect("worker pool channel closed");
        DispatchedJob { shared }
    }

    /// Parents whose jobs have published since the last sweep, in
    /// publication order.
    pub fn drain_completions(&self) -> Vec<CoroId> {
        let done: Vec<CoroId> = self.done_rx.try_iter().collect();
        self.in_flight.set(self.in_flight.get() - done.len());
        done
    }

    fn spawn_worker(&self) {
        let index = self.spawned.get();
        self.spawned.set(index + 1);
        let rx = self.dispatch_rx.clone();
        let done = self.done_tx.clone();
        let wake = self.wake.clone();
        thread::Builder::new()
            .name(format!("lockstep-worker-{index}"))
            .spawn(move || worker_loop(rx, done, wake))
            .expect("failed to spawn worker thread");
    }
}

fn worker_loop(rx: Receiver<Dispatch>, done: Sender<CoroId>, wake: Arc<WakeSignal>) {
    loop {
        let Ok(Dispatch {
            parent,
            func,
            shared,
        }) = rx.recv()
        else {
            break;
        };

        let token = CancelToken {
            shared: shared.clone(),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| func(&token)))
            .unwrap_or_else(|payload| Err(Error::user(PanicError::from_payload(payload))));

        // Publish before reporting: the slot store must be visible once the
        // driver observes the completion.
        *shared.slot.lock() = Some(outcome);
        if done.send(parent).is_err() {
            break;
        }
        wake.notify();
    }
}

/// Release a permit delivered as a resume value, if one is held.
fn release_held(permit: &mut Option<Value>) {
    if let Some(value) = permit.take() {
        if let Some(held) = value.downcast_ref::<Permit>() {
            held.release();
        }
    }
}

/// Thread dispatch capped at a fixed number of concurrent jobs.
///
/// Backed by a coroutine-level [`Semaphore`], so excess jobs queue inside
/// the loop instead of occupying worker threads.
#[derive(Clone)]
pub struct ThreadPool {
    permits: Semaphore,
}

impl ThreadPool {
    /// A pool allowing at most `max` jobs in flight. `max` must be positive.
    pub fn new(max: usize) -> Self {
        ThreadPool {
            permits: Semaphore::new(max),
        }
    }

    /// Run `f` on a worker once a permit is free; the returned coroutine
    /// completes with `f`'s value.
    pub fn run_in_thread<T, F>(&self, f: F) -> Coro
    where
        T: Any + Send,
        F: FnOnce() -> T + Send + 'static,
    {
        let permits = self.permits.clone();
        let mut func = Some(f);
        let mut stage = 0_u8;
        let mut permit: Option<Value> = None;
        Coro::from_fn(move |input| match input {
            Resume::Fault(e) => {
                release_held(&mut permit);
                Err(e)
            }
            _ if stage == 0 => {
                stage = 1;
                Ok(Step::Yield(Yielded::Await(permits.acquire())))
            }
            Resume::Value(value) if stage == 1 => {
                stage = 2;
                permit = Some(value);
                let f = func.take().expect("pooled job started twice");
                Ok(Step::Yield(Yielded::Job(run_in_thread(f))))
            }
            Resume::Value(value) if stage == 2 => {
                release_held(&mut permit);
                Ok(Step::Done(value))
            }
            _ => Err(Error::BadYield(
                "pooled thread job resumed out of order".to_string(),
            )),
        })
    }

    /// Run `f` over `items` on the pool; the returned coroutine completes
    /// with a `Vec<Value>` of the results in input order.
    pub fn map<T, R, F, I>(&self, items: I, f: F) -> Coro
    where
        T: Send + 'static,
        R: Any + Send,
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        let f = Arc::new(f);
        let coros: Vec<Coro> = items
            .into_iter()
            .map(|item| {
                let f = f.clone();
                self.run_in_thread(move || f(item))
            })
            .collect();
        let mut started = false;
        Coro::from_fn(move |input| match input {
            Resume::Fault(e) => Err(e),
            _ if !started => {
                started = true;
                Ok(Step::Yield(Yielded::Gather(coros.clone())))
            }
            Resume::List(values) => Ok(Step::Done(Value::new(values))),
            _ => Err(Error::BadYield(
                "pool map driver resumed out of order".to_string(),
            )),
        })
    }
}
