//! Single-threaded driver loop and the failure controller.
//!
//! The driver owns every table: coroutine records, the FIFO ready queue, the
//! timer queue, and the result table. Worker threads touch only their job
//! slot and the wake signal. Each cycle drains the ready queue, fires due
//! timers, and otherwise blocks on the wake signal no longer than the next
//! timer deadline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::coro::{Coro, CoroId, Yielded};
use crate::error::{CancelledError, Error, ErrorDelivery, ErrorGroup, PanicError};
use crate::event::{WakeList, Wait};
use crate::scheduler::record::{PendingInput, Record, Status};
use crate::scheduler::timer::TimerQueue;
use crate::scheduler::wake::WakeSignal;
use crate::thread::{DispatchedJob, ThreadJob, WorkerPool};
use crate::value::Value;

/// Cooperative scheduler driving coroutines to completion on one thread.
///
/// All parallelism comes from the thread-run bridge; coroutines themselves
/// are multiplexed cooperatively. If any unit fails, every other unit is
/// cancelled, given a chance to clean up, and joined before the error is
/// returned.
pub struct Scheduler {
    pool: WorkerPool,
    wake: Arc<WakeSignal>,
}

impl Scheduler {
    pub fn new() -> Self {
        let wake = Arc::new(WakeSignal::new());
        Scheduler {
            pool: WorkerPool::new(wake.clone()),
            wake,
        }
    }

    /// Drive `root` and everything it transitively yields to completion,
    /// returning `root`'s value.
    ///
    /// The loop returns only once every registered coroutine has completed
    /// and every dispatched thread job has published. Failures are delivered
    /// per [`ErrorDelivery::Single`].
    pub fn run(&mut self, root: Coro) -> Result<Value, Error> {
        self.run_with(root, ErrorDelivery::Single)
    }

    /// Like [`run`](Scheduler::run), with an explicit failure-delivery
    /// policy.
    pub fn run_with(&mut self, root: Coro, delivery: ErrorDelivery) -> Result<Value, Error> {
        Invocation::new(&self.pool, self.wake.clone(), delivery).run(root)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

/// Errors accumulated by the failure controller for one invocation.
struct ShutdownState {
    origin: Arc<Error>,
    /// Non-cancellation errors raised by other units during cleanup.
    siblings: Vec<Error>,
    /// Cancellation errors from units that shut down cleanly.
    cancellations: Vec<Error>,
}

/// All state for one `run` call. A nested scheduler constructed inside a
/// coroutine body gets its own invocation and never touches this one.
struct Invocation<'pool> {
    pool: &'pool WorkerPool,
    wake: Arc<WakeSignal>,
    delivery: ErrorDelivery,
    records: FxHashMap<CoroId, Record>,
    /// Registration order, used for deterministic broadcast.
    order: Vec<CoroId>,
    results: FxHashMap<CoroId, Value>,
    ready: VecDeque<CoroId>,
    timers: TimerQueue,
    /// Coroutines woken by `Event::set`, in wake order.
    inbox: WakeList,
    jobs: FxHashMap<CoroId, DispatchedJob>,
    /// Records not yet completed.
    live: usize,
    shutdown: Option<ShutdownState>,
}

impl<'pool> Invocation<'pool> {
    fn new(pool: &'pool WorkerPool, wake: Arc<WakeSignal>, delivery: ErrorDelivery) -> Self {
        Invocation {
            pool,
            wake,
            delivery,
            records: FxHashMap::default(),
            order: Vec::new(),
            results: FxHashMap::default(),
            ready: VecDeque::new(),
            timers: TimerQueue::new(),
            inbox: Rc::new(RefCell::new(Vec::new())),
            jobs: FxHashMap::default(),
            live: 0,
            shutdown: None,
        }
    }

    fn run(mut self, root: Coro) -> Result<Value, Error> {
        if root.is_finished() {
            log::warn!(
                "coroutine #{} already completed in a previous invocation; treating it as absent",
                root.id().as_u64()
            );
            return Ok(Value::absent());
        }
        let root_id = root.id();
        self.register(root);
        self.drive();
        self.finish(root_id)
    }

    /// The main loop: drain ready, fire timers, block on the wake signal,
    /// sweep thread publications.
    fn drive(&mut self) {
        loop {
            while let Some(id) = self.ready.pop_front() {
                if let Some(record) = self.records.get_mut(&id) {
                    record.queued = false;
                }
                self.step(id);
                self.drain_inbox();
            }
            self.sweep_jobs();
            if !self.ready.is_empty() {
                continue;
            }
            if self.fire_timers() {
                continue;
            }
            if self.live == 0 && self.jobs.is_empty() {
                break;
            }
            match self.timers.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        self.wake.wait_timeout(deadline - now);
                    }
                }
                None if self.jobs.is_empty() => {
                    if self.shutdown.is_none() {
                        self.begin_shutdown(None, Error::Deadlock);
                        continue;
                    }
                    // No wake source left; nothing can change any more.
                    debug_assert!(self.live == 0, "live records with no wake source");
                    break;
                }
                None => self.wake.wait(),
            }
            self.sweep_jobs();
        }
    }

    fn finish(&mut self, root_id: CoroId) -> Result<Value, Error> {
        match self.shutdown.take() {
            None => Ok(self
                .results
                .remove(&root_id)
                .unwrap_or_else(Value::absent)),
            Some(state) => Err(Self::assemble(state, self.delivery)),
        }
    }

    fn assemble(state: ShutdownState, delivery: ErrorDelivery) -> Error {
        let ShutdownState {
            origin,
            siblings,
            cancellations,
        } = state;
        match delivery {
            ErrorDelivery::Off => (*origin).clone(),
            ErrorDelivery::Single => {
                if siblings.is_empty() {
                    (*origin).clone()
                } else {
                    Error::Group(ErrorGroup::new(origin, siblings))
                }
            }
            ErrorDelivery::Group => {
                let mut members = siblings;
                members.extend(cancellations);
                Error::Group(ErrorGroup::new(origin, members))
            }
        }
    }

    // =========================================================================
    // Registration and the ready queue
    // =========================================================================

    fn register(&mut self, coro: Coro) {
        let id = coro.id();
        debug_assert!(!self.records.contains_key(&id), "coroutine registered twice");
        self.records.insert(id, Record::new(coro));
        self.order.push(id);
        self.live += 1;
        self.enqueue(id);
    }

    fn enqueue(&mut self, id: CoroId) {
        if let Some(record) = self.records.get_mut(&id) {
            if !record.queued && !record.status.is_completed() {
                record.queued = true;
                self.ready.push_back(id);
            }
        }
    }

    /// Move coroutines woken by `Event::set` onto the ready queue, in wake
    /// order.
    fn drain_inbox(&mut self) {
        let woken: Vec<CoroId> = self.inbox.borrow_mut().drain(..).collect();
        for id in woken {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.status != Status::AwaitingEvent {
                continue;
            }
            let event = record.waiting_event.take();
            record.epoch += 1;
            record.status = Status::Runnable;
            record.input = event.map(PendingInput::EventResult);
            self.timers.remove(id);
            self.enqueue(id);
        }
    }

    /// Wake every coroutine whose timer deadline has passed.
    fn fire_timers(&mut self) -> bool {
        let due = self.timers.pop_due(Instant::now());
        let mut woke = false;
        for (id, epoch) in due {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.epoch != epoch || record.status != Status::AwaitingEvent {
                continue;
            }
            let event = record.waiting_event.take();
            if let Some(event) = &event {
                event.remove_waiter(id);
            }
            record.epoch += 1;
            record.status = Status::Runnable;
            record.input = event.map(PendingInput::EventResult);
            self.enqueue(id);
            woke = true;
        }
        woke
    }

    /// Transfer published thread results into their parents' resume inputs.
    fn sweep_jobs(&mut self) {
        for parent in self.pool.drain_completions() {
            let Some(job) = self.jobs.remove(&parent) else {
                continue;
            };
            let Some(outcome) = job.take_outcome() else {
                continue;
            };
            match outcome {
                Ok(payload) => {
                    let Some(record) = self.records.get_mut(&parent) else {
                        continue;
                    };
                    if record.status == Status::AwaitingThread {
                        record.status = Status::Runnable;
                        record.input = Some(PendingInput::Value(Value::from_boxed(payload)));
                        self.enqueue(parent);
                    }
                    // Otherwise the parent was already cancelled; the value
                    // is discarded in favour of the cancellation.
                }
                Err(error) => match &mut self.shutdown {
                    Some(state) => state.siblings.push(error),
                    None => self.begin_shutdown(None, error),
                },
            }
        }
    }

    // =========================================================================
    // Stepping and yield classification
    // =========================================================================

    fn step(&mut self, id: CoroId) {
        let (coro, input) = {
            let Some(record) = self.records.get_mut(&id) else {
                return;
            };
            if record.status.is_completed() {
                return;
            }
            record.status = Status::Runnable;
            let input = record
                .input
                .take()
                .unwrap_or(PendingInput::Empty)
                .into_resume();
            (record.coro.clone(), input)
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| coro.resume(input)));
        match outcome {
            Ok(Ok(crate::coro::Step::Done(value))) => self.complete_ok(id, value),
            Ok(Ok(crate::coro::Step::Yield(yielded))) => self.handle_yield(id, yielded),
            Ok(Err(error)) => self.complete_err(id, error),
            Err(payload) => {
                self.complete_err(id, Error::user(PanicError::from_payload(payload)))
            }
        }
    }

    fn handle_yield(&mut self, id: CoroId, yielded: Yielded) {
        if self.shutdown.is_some() {
            self.handle_yield_during_shutdown(id, yielded);
            return;
        }
        match yielded {
            Yielded::Pause => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.input = Some(PendingInput::Empty);
                }
                self.enqueue(id);
            }
            Yielded::Await(child) => self.install_children(id, vec![child], true),
            Yielded::Gather(children) => self.install_children(id, children, false),
            Yielded::Spawn(coros) => {
                for coro in coros {
                    self.adopt(coro);
                }
                if let Some(record) = self.records.get_mut(&id) {
                    record.input = Some(PendingInput::Empty);
                }
                self.enqueue(id);
            }
            Yielded::Wait(wait) => self.install_wait(id, wait),
            Yielded::Job(job) => self.install_job(id, job),
            Yielded::Cancel { target, error } => self.install_cancel(id, target, error),
        }
    }

    /// During shutdown every yield is answered with a fresh cancellation;
    /// newly yielded coroutines are still registered so they too are
    /// cancelled, and new blocking work is not started.
    fn handle_yield_during_shutdown(&mut self, id: CoroId, yielded: Yielded) {
        let origin = self
            .shutdown
            .as_ref()
            .map(|state| state.origin.clone())
            .expect("shutdown state");
        let children = match yielded {
            Yielded::Await(child) => vec![child],
            Yielded::Gather(children) | Yielded::Spawn(children) => children,
            Yielded::Pause | Yielded::Wait(_) | Yielded::Job(_) | Yielded::Cancel { .. } => {
                Vec::new()
            }
        };
        for child in children {
            if child.is_finished() || self.records.contains_key(&child.id()) {
                continue;
            }
            let child_id = child.id();
            self.register(child);
            if let Some(record) = self.records.get_mut(&child_id) {
                record.cancel_injected = true;
                record.input = Some(PendingInput::Fault(Error::Cancelled(
                    CancelledError::with_origin(origin.clone()),
                )));
            }
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.cancel_injected = true;
            record.input = Some(PendingInput::Fault(Error::Cancelled(
                CancelledError::with_origin(origin),
            )));
        }
        self.enqueue(id);
    }

    /// Register a background coroutine, resolving handles reused across
    /// invocations to a warning.
    fn adopt(&mut self, coro: Coro) {
        let id = coro.id();
        if self.results.contains_key(&id) || self.records.contains_key(&id) {
            return;
        }
        if coro.is_finished() {
            log::warn!(
                "coroutine #{} already completed in a previous invocation; treating it as absent",
                id.as_u64()
            );
            self.results.insert(id, Value::absent());
            return;
        }
        self.register(coro);
    }

    fn install_children(&mut self, parent: CoroId, children: Vec<Coro>, single: bool) {
        let mut pending = 0;
        for child in &children {
            let child_id = child.id();
            if child_id == parent {
                self.complete_err(
                    parent,
                    Error::BadYield("coroutine awaited itself".to_string()),
                );
                return;
            }
            if self.results.contains_key(&child_id) {
                continue;
            }
            if child.is_finished() {
                log::warn!(
                    "coroutine #{} already completed in a previous invocation; treating it as absent",
                    child_id.as_u64()
                );
                self.results.insert(child_id, Value::absent());
                continue;
            }
            if !self.records.contains_key(&child_id) {
                self.register(child.clone());
            }
            let record = self
                .records
                .get_mut(&child_id)
                .expect("child registered above");
            record.parents.push(parent);
            pending += 1;
        }

        let child_ids: Vec<CoroId> = children.iter().map(Coro::id).collect();
        if pending == 0 {
            let input = self.child_results(&child_ids, single);
            if let Some(record) = self.records.get_mut(&parent) {
                record.input = Some(input);
            }
            self.enqueue(parent);
            return;
        }
        if let Some(record) = self.records.get_mut(&parent) {
            record.children = child_ids;
            record.single_await = single;
            record.pending_children = pending;
            record.status = Status::AwaitingChildren;
        }
    }

    /// Build the resume input for a parent whose children all have results.
    fn child_results(&self, children: &[CoroId], single: bool) -> PendingInput {
        if single {
            let value = children
                .first()
                .and_then(|id| self.results.get(id))
                .cloned()
                .unwrap_or_else(Value::absent);
            PendingInput::Value(value)
        } else {
            PendingInput::List(
                children
                    .iter()
                    .map(|id| {
                        self.results
                            .get(id)
                            .cloned()
                            .unwrap_or_else(Value::absent)
                    })
                    .collect(),
            )
        }
    }

    fn install_wait(&mut self, parent: CoroId, wait: Wait) {
        let Wait { event, timeout } = wait;
        let Some(record) = self.records.get_mut(&parent) else {
            return;
        };
        if event.is_set() {
            // Resolved within one scheduling cycle; the flag is re-read at
            // resumption so an interleaved clear is observed.
            record.input = Some(PendingInput::EventResult(event));
            self.enqueue(parent);
            return;
        }
        record.status = Status::AwaitingEvent;
        record.epoch += 1;
        let epoch = record.epoch;
        event.register_waiter(parent, &self.inbox);
        record.waiting_event = Some(event);
        if let Some(timeout) = timeout {
            self.timers.insert(Instant::now() + timeout, parent, epoch);
        }
    }

    fn install_job(&mut self, parent: CoroId, job: ThreadJob) {
        let Some(record) = self.records.get_mut(&parent) else {
            return;
        };
        record.status = Status::AwaitingThread;
        let dispatched = self.pool.dispatch(parent, job);
        self.jobs.insert(parent, dispatched);
    }

    /// Fail one coroutine without failing the loop: its awaiters receive the
    /// error as their resume input and decide what to do with it.
    fn install_cancel(&mut self, yielder: CoroId, target: Coro, error: Error) {
        let target_id = target.id();
        if target_id == yielder {
            self.complete_err(
                yielder,
                Error::BadYield("coroutine cancelled itself".to_string()),
            );
            return;
        }
        if self.results.contains_key(&target_id)
            || self
                .records
                .get(&target_id)
                .is_some_and(|record| record.status.is_completed())
        {
            // Completed in the meantime; nothing to cancel.
        } else if self.records.contains_key(&target_id) {
            self.detach(target_id);
            let record = self.records.get_mut(&target_id).expect("target registered");
            record.status = Status::Runnable;
            record.cancel_injected = true;
            record.targeted_cancel = true;
            record.input = Some(PendingInput::Fault(error));
            self.enqueue(target_id);
        } else {
            self.complete_err(
                yielder,
                Error::BadYield("cancelled a coroutine that was never registered".to_string()),
            );
            return;
        }
        if let Some(record) = self.records.get_mut(&yielder) {
            record.input = Some(PendingInput::Empty);
        }
        self.enqueue(yielder);
    }

    /// Remove a record from every wait-set: child/parent edges, event
    /// waiters, timers, and (advisorily) its thread job.
    fn detach(&mut self, id: CoroId) {
        let (children, waiting_event, awaiting_thread) = {
            let Some(record) = self.records.get_mut(&id) else {
                return;
            };
            let children = std::mem::take(&mut record.children);
            record.pending_children = 0;
            record.epoch += 1;
            (
                children,
                record.waiting_event.take(),
                record.status == Status::AwaitingThread,
            )
        };
        for child_id in children {
            if let Some(child) = self.records.get_mut(&child_id) {
                child.parents.retain(|parent| *parent != id);
            }
        }
        if let Some(event) = waiting_event {
            event.remove_waiter(id);
        }
        self.timers.remove(id);
        if awaiting_thread {
            if let Some(job) = self.jobs.get(&id) {
                job.request_cancel();
            }
        }
    }

    // =========================================================================
    // Completion and the failure controller
    // =========================================================================

    fn complete_ok(&mut self, id: CoroId, value: Value) {
        let parents = {
            let Some(record) = self.records.get_mut(&id) else {
                return;
            };
            if record.status.is_completed() {
                return;
            }
            record.status = Status::CompletedOk;
            record.coro.mark_finished();
            if self.shutdown.is_some() && record.cancel_injected {
                log::warn!(
                    "coroutine #{} completed with a value instead of propagating its cancellation",
                    id.as_u64()
                );
            }
            std::mem::take(&mut record.parents)
        };
        self.live -= 1;
        self.results.entry(id).or_insert(value);
        for parent in parents {
            self.notify_parent(parent);
        }
    }

    /// One child result arrived for `parent`; resume it once nothing is
    /// missing.
    fn notify_parent(&mut self, parent: CoroId) {
        let ready = {
            let Some(record) = self.records.get_mut(&parent) else {
                return;
            };
            if record.status != Status::AwaitingChildren {
                return;
            }
            record.pending_children -= 1;
            if record.pending_children > 0 {
                return;
            }
            (std::mem::take(&mut record.children), record.single_await)
        };
        let input = self.child_results(&ready.0, ready.1);
        if let Some(record) = self.records.get_mut(&parent) {
            record.status = Status::Runnable;
            record.input = Some(input);
        }
        self.enqueue(parent);
    }

    fn complete_err(&mut self, id: CoroId, error: Error) {
        let (targeted, parents, warn_improper) = {
            let Some(record) = self.records.get_mut(&id) else {
                return;
            };
            if record.status.is_completed() {
                return;
            }
            let cancellation = error.is_cancelled();
            record.status = if cancellation {
                Status::Cancelled
            } else {
                Status::CompletedErr
            };
            record.coro.mark_finished();
            (
                record.targeted_cancel,
                std::mem::take(&mut record.parents),
                record.cancel_injected && !cancellation,
            )
        };
        self.live -= 1;

        if let Some(state) = &mut self.shutdown {
            if error.is_cancelled() {
                state.cancellations.push(error);
            } else {
                if warn_improper {
                    log::warn!(
                        "coroutine #{} raised `{}` instead of propagating its cancellation",
                        id.as_u64(),
                        error
                    );
                }
                state.siblings.push(error);
            }
            return;
        }

        if targeted {
            // A targeted cancellation stays scoped: awaiters receive the
            // error at their suspension point and the loop keeps running.
            let mut seen = Vec::new();
            for parent in parents {
                if seen.contains(&parent) {
                    continue;
                }
                seen.push(parent);
                let awaiting = self
                    .records
                    .get(&parent)
                    .is_some_and(|record| record.status == Status::AwaitingChildren);
                if !awaiting {
                    continue;
                }
                // Fully detach so surviving siblings of the gather do not
                // notify a parent that is no longer counting them.
                self.detach(parent);
                let record = self.records.get_mut(&parent).expect("record exists");
                record.status = Status::Runnable;
                record.cancel_injected = true;
                record.input = Some(PendingInput::Fault(error.clone()));
                self.enqueue(parent);
            }
            return;
        }

        self.begin_shutdown(Some(id), error);
    }

    /// The failure controller: record the origin, cancel every live unit in
    /// registration order, and ask outstanding thread jobs to stop. The
    /// second-phase pump in `drive` then joins everything.
    fn begin_shutdown(&mut self, origin_id: Option<CoroId>, error: Error) {
        debug_assert!(self.shutdown.is_none(), "shutdown already in progress");
        let origin = Arc::new(error);
        self.shutdown = Some(ShutdownState {
            origin: origin.clone(),
            siblings: Vec::new(),
            cancellations: Vec::new(),
        });
        let ids = self.order.clone();
        for id in ids {
            if Some(id) == origin_id {
                continue;
            }
            let Some(record) = self.records.get(&id) else {
                continue;
            };
            if record.status.is_completed() {
                continue;
            }
            self.detach(id);
            let record = self.records.get_mut(&id).expect("record exists");
            record.status = Status::Runnable;
            record.cancel_injected = true;
            record.input = Some(PendingInput::Fault(Error::Cancelled(
                CancelledError::with_origin(origin.clone()),
            )));
            self.enqueue(id);
        }
        for job in self.jobs.values() {
            job.request_cancel();
        }
    }
}
