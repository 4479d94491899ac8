//! # lockstep
//!
//! A minimal cooperative event loop with strict failure atomicity.
//!
//! `lockstep` multiplexes resumable state-machine coroutines on a single
//! driver thread, with an auxiliary worker-thread pool for blocking calls.
//! Its defining property is predictable error propagation: when any
//! coroutine or thread job fails, every other unit is cancelled, given a
//! chance to clean up, and joined before the originating error is returned
//! to the caller. Throughput, fairness, and timer precision are explicitly
//! secondary.
//!
//! A coroutine is any [`Coroutine`] state machine. Each resumption receives
//! a [`Resume`] input and either finishes with a [`Value`] or suspends with
//! a classified [`Yielded`] object: a bare pause, a subordinate coroutine,
//! an ordered gather, a background spawn, a timed [`Event`] wait, or a
//! blocking [`ThreadJob`].
//!
//! ```rust,ignore
//! use lockstep::{run_in_thread, Coro, Resume, Scheduler, Step, Value, Yielded};
//!
//! fn fetch_both() -> Coro {
//!     let mut started = false;
//!     Coro::from_fn(move |input| match input {
//!         Resume::Fault(e) => Err(e),
//!         _ if !started => {
//!             started = true;
//!             Ok(Step::Yield(Yielded::Gather(vec![
//!                 Coro::from_fn(|_| Ok(Step::Done(Value::new(1_i32)))),
//!                 Coro::from_fn(|_| Ok(Step::Done(Value::new(2_i32)))),
//!             ])))
//!         }
//!         Resume::List(values) => Ok(Step::Done(Value::new(values))),
//!         _ => unreachable!(),
//!     })
//! }
//!
//! let mut scheduler = Scheduler::new();
//! let out = scheduler.run(fetch_both()).unwrap();
//! ```

pub mod background;
pub mod coro;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod time;
pub mod value;

pub use background::as_completed;
pub use coro::{Coro, CoroId, Coroutine, Resume, Step, Yielded};
pub use error::{
    CancelledError, Error, ErrorDelivery, ErrorGroup, PanicError, UserError,
};
pub use event::{Event, Wait};
pub use scheduler::Scheduler;
pub use sync::{Barrier, Lock, Permit, Semaphore};
pub use thread::{
    run_in_thread, run_in_thread_cancellable, try_run_in_thread, CancelToken, ThreadJob,
    ThreadPool,
};
pub use time::{sleep, timeout};
pub use value::Value;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
