//! Per-coroutine bookkeeping for one scheduler invocation.

use crate::coro::{Coro, CoroId, Resume};
use crate::error::Error;
use crate::event::Event;
use crate::value::Value;

/// Lifecycle of a coroutine within an invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    /// Queued, or about to be queued, for resumption.
    Runnable,
    /// Suspended until every gathered child has a result.
    AwaitingChildren,
    /// Suspended on an event wait or timer.
    AwaitingEvent,
    /// Suspended until a worker publishes the job result.
    AwaitingThread,
    /// Finished with a value.
    CompletedOk,
    /// Finished with an error.
    CompletedErr,
    /// Finished by cancellation.
    Cancelled,
}

impl Status {
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            Status::CompletedOk | Status::CompletedErr | Status::Cancelled
        )
    }
}

/// Input stored on a record until its next resumption.
///
/// Event outcomes stay symbolic so the flag is read at resumption time, not
/// at wake time: a `clear()` racing the wake is observed by the waiter.
pub(crate) enum PendingInput {
    Empty,
    Value(Value),
    List(Vec<Value>),
    EventResult(Event),
    Fault(Error),
}

impl PendingInput {
    pub fn into_resume(self) -> Resume {
        match self {
            PendingInput::Empty => Resume::Empty,
            PendingInput::Value(value) => Resume::Value(value),
            PendingInput::List(values) => Resume::List(values),
            PendingInput::EventResult(event) => Resume::Set(event.is_set()),
            PendingInput::Fault(error) => Resume::Fault(error),
        }
    }
}

/// Driver-owned record for one registered coroutine.
pub(crate) struct Record {
    pub coro: Coro,
    pub status: Status,
    /// Input to deliver at the next resumption.
    pub input: Option<PendingInput>,
    /// Children gathered on, in yield order; duplicates kept per position.
    pub children: Vec<CoroId>,
    /// Whether the suspension was a single await (deliver a bare value)
    /// rather than a gather (deliver a positional list).
    pub single_await: bool,
    /// Results still missing before this record can resume; duplicate
    /// children count once per occurrence.
    pub pending_children: usize,
    /// Parents gathered on this record; one entry per awaited position.
    pub parents: Vec<CoroId>,
    /// Event this record is parked on, kept for deregistration.
    pub waiting_event: Option<Event>,
    /// Timer epoch; bumping it tombstones any queued timer entry.
    pub epoch: u64,
    /// Whether this record is currently in the ready queue.
    pub queued: bool,
    /// Whether a cancellation or targeted error has been injected.
    pub cancel_injected: bool,
    /// Whether the record was failed by a targeted `Yielded::Cancel`, which
    /// propagates to its awaiters without shutting the loop down.
    pub targeted_cancel: bool,
}

impl Record {
    pub fn new(coro: Coro) -> Self {
        Record {
            coro,
            status: Status::Runnable,
            input: None,
            children: Vec::new(),
            single_await: false,
            pending_children: 0,
            parents: Vec::new(),
            waiting_event: None,
            epoch: 0,
            queued: false,
            cancel_injected: false,
            targeted_cancel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_completion_predicate() {
        assert!(Status::CompletedOk.is_completed());
        assert!(Status::CompletedErr.is_completed());
        assert!(Status::Cancelled.is_completed());
        assert!(!Status::Runnable.is_completed());
        assert!(!Status::AwaitingChildren.is_completed());
        assert!(!Status::AwaitingEvent.is_completed());
        assert!(!Status::AwaitingThread.is_completed());
    }

    #[test]
    fn test_event_result_reads_flag_at_resumption() {
        let event = Event::new();
        event.set();
        let pending = PendingInput::EventResult(event.clone());
        event.clear();
        assert!(matches!(pending.into_resume(), Resume::Set(false)));
    }

    #[test]
    fn test_new_record_defaults() {
        let record = Record::new(Coro::ready(Value::absent()));
        assert_eq!(record.status, Status::Runnable);
        assert!(record.input.is_none());
        assert!(record.children.is_empty());
        assert!(record.parents.is_empty());
        assert!(!record.queued);
        assert!(!record.cancel_injected);
    }
}
