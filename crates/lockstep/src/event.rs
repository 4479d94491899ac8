//! One-shot/reset wake signal with optional timeout.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::coro::CoroId;

/// Coroutines woken by `Event::set`, in wake order, waiting for the driver
/// to collect them.
pub(crate) type WakeList = Rc<RefCell<Vec<CoroId>>>;

struct Waiter {
    coro: CoroId,
    /// Wake list of the scheduler invocation that parked the coroutine. Weak
    /// so a forgotten event cannot keep a finished invocation alive.
    inbox: Weak<RefCell<Vec<CoroId>>>,
}

struct EventInner {
    flag: bool,
    waiters: Vec<Waiter>,
}

/// A marker that something has happened.
///
/// Events are driver-thread only: coroutines set and clear them, and worker
/// threads communicate through the thread-run bridge instead. Waiters parked
/// on an event wake in the order they started waiting; waiters that park
/// after a set must await the next one.
#[derive(Clone)]
pub struct Event {
    inner: Rc<RefCell<EventInner>>,
}

impl Event {
    /// A new event with the flag down.
    pub fn new() -> Self {
        Event {
            inner: Rc::new(RefCell::new(EventInner {
                flag: false,
                waiters: Vec::new(),
            })),
        }
    }

    /// The current flag.
    pub fn is_set(&self) -> bool {
        self.inner.borrow().flag
    }

    /// Raise the flag and make every currently parked waiter runnable, in
    /// their original waiting order.
    pub fn set(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.flag {
            inner.flag = true;
            for waiter in inner.waiters.drain(..) {
                if let Some(inbox) = waiter.inbox.upgrade() {
                    inbox.borrow_mut().push(waiter.coro);
                }
            }
        }
    }

    /// Lower the flag. Parked waiters are not touched: a waiter already woken
    /// by a set keeps its wake, though it will observe the flag as it is at
    /// resumption time.
    pub fn clear(&self) {
        self.inner.borrow_mut().flag = false;
    }

    /// Suspend the yielding coroutine until the flag is set.
    pub fn wait(&self) -> Wait {
        Wait {
            event: self.clone(),
            timeout: None,
        }
    }

    /// Suspend the yielding coroutine until the flag is set or `timeout`
    /// elapses, whichever comes first.
    pub fn wait_timeout(&self, timeout: Duration) -> Wait {
        Wait {
            event: self.clone(),
            timeout: Some(timeout),
        }
    }

    pub(crate) fn register_waiter(&self, coro: CoroId, inbox: &WakeList) {
        self.inner.borrow_mut().waiters.push(Waiter {
            coro,
            inbox: Rc::downgrade(inbox),
        });
    }

    pub(crate) fn remove_waiter(&self, coro: CoroId) {
        self.inner
            .borrow_mut()
            .waiters
            .retain(|waiter| waiter.coro != coro);
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

/// Handle produced by [`Event::wait`]; yield it to park the coroutine.
///
/// A `Wait` is single-use by construction: yielding it moves it, so one
/// handle cannot be waited on twice.
pub struct Wait {
    pub(crate) event: Event,
    pub(crate) timeout: Option<Duration>,
}

impl std::fmt::Debug for Wait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wait").field("timeout", &self.timeout).finish()
    }
}
