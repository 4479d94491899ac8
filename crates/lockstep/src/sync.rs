//! Coroutine-level synchronization primitives built on [`Event`].
//!
//! These limit or order coroutines within one loop; they are not thread
//! synchronizers. Acquisition coroutines re-check their gate in a loop, so a
//! wake that loses the race simply parks again.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::coro::{Coro, Resume, Step};
use crate::event::Event;
use crate::value::Value;

struct SemState {
    permits: usize,
    gate: Event,
}

/// Limits coroutines so that at most `n` of them hold a [`Permit`] at once.
///
/// `acquire` completes with a `Permit` value. Call [`Permit::release`] when
/// done, including from the `Resume::Fault` arm of the holding coroutine so
/// waiters are woken promptly; a permit that is never released explicitly
/// still returns itself when its last handle is dropped, at the latest when
/// the invocation that delivered it is torn down.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<SemState>>,
}

impl Semaphore {
    /// A semaphore with `permits` slots. `permits` must be positive.
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "semaphore must have at least one permit");
        let gate = Event::new();
        gate.set();
        Semaphore {
            inner: Rc::new(RefCell::new(SemState { permits, gate })),
        }
    }

    /// A coroutine that completes with a [`Permit`] once one is free.
    pub fn acquire(&self) -> Coro {
        let sem = self.clone();
        Coro::from_fn(move |input| {
            if let Resume::Fault(e) = input {
                return Err(e);
            }
            let mut state = sem.inner.borrow_mut();
            if state.permits > 0 {
                state.permits -= 1;
                if state.permits == 0 {
                    state.gate.clear();
                }
                drop(state);
                Ok(Step::Done(Value::new(Permit {
                    state: sem.inner.clone(),
                    released: Cell::new(false),
                })))
            } else {
                let wait = state.gate.wait();
                drop(state);
                Ok(Step::Yield(wait.into()))
            }
        })
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.inner.borrow().permits
    }
}

/// A held semaphore slot, delivered as the value of
/// [`Semaphore::acquire`].
///
/// `release` is idempotent, and an unreleased permit releases itself when
/// its last handle drops. The loop's result table keeps a handle to every
/// delivered value until the invocation ends, so the drop is a backstop
/// against cancelled holders, not a substitute for releasing eagerly.
pub struct Permit {
    state: Rc<RefCell<SemState>>,
    released: Cell<bool>,
}

impl Permit {
    /// Return the permit and wake waiters. Calling this more than once has
    /// no further effect.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        let gate = {
            let mut state = self.state.borrow_mut();
            state.permits += 1;
            state.gate.clone()
        };
        gate.set();
    }

    /// Whether this permit has already been returned.
    pub fn is_released(&self) -> bool {
        self.released.get()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

/// Prevents multiple coroutines from accessing a single resource.
#[derive(Clone)]
pub struct Lock {
    semaphore: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            semaphore: Semaphore::new(1),
        }
    }

    /// A coroutine that completes with the lock's [`Permit`]; release it to
    /// unlock.
    pub fn acquire(&self) -> Coro {
        self.semaphore.acquire()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

struct BarrierState {
    arrivals: usize,
    threshold: usize,
    gate: Event,
}

/// Blocks coroutines until at least `n` of them have called
/// [`wait`](Barrier::wait); each waiter completes with its arrival index.
#[derive(Clone)]
pub struct Barrier {
    inner: Rc<RefCell<BarrierState>>,
}

impl Barrier {
    pub fn new(n: usize) -> Self {
        Barrier {
            inner: Rc::new(RefCell::new(BarrierState {
                arrivals: 0,
                threshold: n,
                gate: Event::new(),
            })),
        }
    }

    /// A coroutine that completes, with the arrival index as a `usize`
    /// value, once the threshold is reached.
    pub fn wait(&self) -> Coro {
        let barrier = self.clone();
        let mut index = None;
        Coro::from_fn(move |input| match input {
            Resume::Fault(e) => Err(e),
            _ if index.is_none() => {
                let mut state = barrier.inner.borrow_mut();
                let arrival = state.arrivals;
                state.arrivals += 1;
                index = Some(arrival);
                if state.arrivals >= state.threshold {
                    state.gate.set();
                }
                let wait = state.gate.wait();
                drop(state);
                Ok(Step::Yield(wait.into()))
            }
            _ => Ok(Step::Done(Value::new(index.unwrap_or(0)))),
        })
    }
}
