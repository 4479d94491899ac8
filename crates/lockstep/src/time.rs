//! Timed waits: `sleep` and `timeout`.

use std::time::Duration;

use crate::coro::{Coro, Resume, Step, Yielded};
use crate::error::Error;
use crate::event::{Event, Wait};
use crate::value::Value;

/// Park the yielding coroutine for `duration` without blocking the loop.
///
/// Defined as a timed wait on a fresh event that is never set, so the wake
/// always comes from the timer queue and resumes with `Resume::Set(false)`.
pub fn sleep(duration: Duration) -> Wait {
    Event::new().wait_timeout(duration)
}

/// Run `coro` for at most `limit`.
///
/// The returned coroutine completes with a `(Option<Value>, bool)` value:
/// `(Some(result), true)` when `coro` finished in time, `(None, false)`
/// otherwise. On expiry an [`Error::Timeout`] is injected into `coro` at its
/// suspension point; the rest of the loop keeps running.
pub fn timeout(coro: Coro, limit: Duration) -> Coro {
    let done = Event::new();
    let watcher = watch(coro.clone(), done.clone());
    let mut stage = 0_u8;
    Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if stage == 0 => {
            stage = 1;
            Ok(Step::Yield(Yielded::Spawn(vec![watcher.clone()])))
        }
        _ if stage == 1 => {
            stage = 2;
            Ok(Step::Yield(done.wait_timeout(limit).into()))
        }
        Resume::Set(true) if stage == 2 => {
            stage = 3;
            Ok(Step::Yield(Yielded::Await(coro.clone())))
        }
        _ if stage == 2 => {
            stage = 4;
            Ok(Step::Yield(Yielded::Cancel {
                target: coro.clone(),
                error: Error::Timeout,
            }))
        }
        Resume::Value(value) if stage == 3 => {
            Ok(Step::Done(Value::new((Some(value), true))))
        }
        _ if stage == 4 => Ok(Step::Done(Value::new((None::<Value>, false)))),
        _ => Err(Error::BadYield(
            "timeout driver resumed out of order".to_string(),
        )),
    })
}

/// Awaits `coro` in the background and sets `done` when it finishes. Errors
/// injected by the deadline path are absorbed here so the expiry of the
/// watched coroutine does not fail the loop.
fn watch(coro: Coro, done: Event) -> Coro {
    let mut started = false;
    Coro::from_fn(move |input| match input {
        Resume::Fault(e) if matches!(e, Error::Timeout) => {
            done.set();
            Ok(Step::Done(Value::absent()))
        }
        Resume::Fault(e) => Err(e),
        _ if !started => {
            started = true;
            Ok(Step::Yield(Yielded::Await(coro.clone())))
        }
        _ => {
            done.set();
            Ok(Step::Done(Value::absent()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::time::Instant;

    /// Sleeps for `pause`, then completes with `result`.
    fn slow_value(pause: Duration, result: i32) -> Coro {
        let mut started = false;
        Coro::from_fn(move |input| match input {
            Resume::Fault(e) => Err(e),
            _ if !started => {
                started = true;
                Ok(Step::Yield(sleep(pause).into()))
            }
            _ => Ok(Step::Done(Value::new(result))),
        })
    }

    #[test]
    fn test_sleep_parks_for_roughly_the_duration() {
        let mut scheduler = Scheduler::new();
        let start = Instant::now();
        scheduler
            .run(slow_value(Duration::from_millis(50), 3))
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[test]
    fn test_timeout_completes_in_time() {
        let mut scheduler = Scheduler::new();
        let coro = timeout(
            slow_value(Duration::from_millis(10), 3),
            Duration::from_millis(200),
        );
        let out = scheduler.run(coro).unwrap();
        let (value, finished) = &*out.downcast::<(Option<Value>, bool)>().unwrap();
        assert!(*finished);
        assert_eq!(
            value.as_ref().unwrap().downcast_ref::<i32>(),
            Some(&3)
        );
    }

    #[test]
    fn test_timeout_expires_without_failing_the_loop() {
        let mut scheduler = Scheduler::new();
        let coro = timeout(
            slow_value(Duration::from_millis(200), 3),
            Duration::from_millis(20),
        );
        let start = Instant::now();
        let out = scheduler.run(coro).unwrap();
        let (value, finished) = &*out.downcast::<(Option<Value>, bool)>().unwrap();
        assert!(!*finished);
        assert!(value.is_none());
        // The watched coroutine was cancelled, not waited out.
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_back_to_back_timeouts() {
        // One loop can time out a coroutine and then run another to success.
        let mut scheduler = Scheduler::new();
        let first = timeout(
            slow_value(Duration::from_millis(100), 1),
            Duration::from_millis(10),
        );
        let second = timeout(
            slow_value(Duration::from_millis(10), 2),
            Duration::from_millis(100),
        );

        let out = scheduler.run(first).unwrap();
        let (_, finished) = &*out.downcast::<(Option<Value>, bool)>().unwrap();
        assert!(!finished);

        let out = scheduler.run(second).unwrap();
        let (value, finished) = &*out.downcast::<(Option<Value>, bool)>().unwrap();
        assert!(*finished);
        assert_eq!(value.as_ref().unwrap().downcast_ref::<i32>(), Some(&2));
    }
}
