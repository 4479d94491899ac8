//! End-to-end scenarios for the cooperative loop: gathers, diamonds, timed
//! waits, and failure atomicity.

use std::time::{Duration, Instant};

use lockstep::{sleep, Coro, Error, Event, Resume, Scheduler, Step, Value, Yielded};

/// Sleeps for `pause`, then completes with `x + 1`.
fn slow_add_one(pause: Duration, x: i32) -> Coro {
    let mut started = false;
    Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if !started => {
            started = true;
            Ok(Step::Yield(sleep(pause).into()))
        }
        _ => Ok(Step::Done(Value::new(x + 1))),
    })
}

/// Gathers `children` and completes with their `i32` results.
fn gather_ints(children: Vec<Coro>) -> Coro {
    let mut started = false;
    Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if !started => {
            started = true;
            Ok(Step::Yield(Yielded::Gather(children.clone())))
        }
        Resume::List(values) => {
            let ints: Vec<i32> = values
                .iter()
                .map(|v| *v.downcast_ref::<i32>().unwrap())
                .collect();
            Ok(Step::Done(Value::new(ints)))
        }
        _ => unreachable!(),
    })
}

#[derive(Debug, thiserror::Error)]
#[error("value error: {0}")]
struct ValueError(&'static str);

#[test]
fn test_gather_add_one_runs_concurrently() {
    let mut scheduler = Scheduler::new();
    let start = Instant::now();
    let out = scheduler
        .run(gather_ints(vec![
            slow_add_one(Duration::from_millis(50), 3),
            slow_add_one(Duration::from_millis(50), 4),
        ]))
        .unwrap();
    let elapsed = start.elapsed();
    assert_eq!(*out.downcast_ref::<Vec<i32>>().unwrap(), vec![4, 5]);
    // Both sleeps overlap: one deadline, not two in sequence.
    assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
}

#[test]
fn test_wide_gather_of_sleepers() {
    let mut scheduler = Scheduler::new();
    let children = (0..100)
        .map(|_| slow_add_one(Duration::from_millis(20), 1))
        .collect();
    let start = Instant::now();
    let out = scheduler.run(gather_ints(children)).unwrap();
    assert_eq!(*out.downcast_ref::<Vec<i32>>().unwrap(), vec![2; 100]);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_diamond_dependency_delivers_one_value_twice() {
    // Parent gathers two children that each gather the same grandchild; the
    // grandchild runs once and its value arrives as [[v], [v]].
    let grandchild = slow_add_one(Duration::from_millis(10), 6);
    let branch = |shared: Coro| {
        let mut started = false;
        Coro::from_fn(move |input| match input {
            Resume::Fault(e) => Err(e),
            _ if !started => {
                started = true;
                Ok(Step::Yield(Yielded::Gather(vec![shared.clone()])))
            }
            Resume::List(values) => {
                assert_eq!(values.len(), 1);
                let v = *values[0].downcast_ref::<i32>().unwrap();
                Ok(Step::Done(Value::new(vec![v])))
            }
            _ => unreachable!(),
        })
    };

    let mut started = false;
    let children = vec![branch(grandchild.clone()), branch(grandchild)];
    let parent = Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if !started => {
            started = true;
            Ok(Step::Yield(Yielded::Gather(children.clone())))
        }
        Resume::List(values) => {
            let lists: Vec<Vec<i32>> = values
                .iter()
                .map(|v| v.downcast_ref::<Vec<i32>>().unwrap().clone())
                .collect();
            Ok(Step::Done(Value::new(lists)))
        }
        _ => unreachable!(),
    });

    let mut scheduler = Scheduler::new();
    let out = scheduler.run(parent).unwrap();
    assert_eq!(
        *out.downcast_ref::<Vec<Vec<i32>>>().unwrap(),
        vec![vec![7], vec![7]]
    );
}

#[test]
fn test_single_error_is_delivered_unwrapped() {
    let raiser = Coro::from_fn(|input| match input {
        Resume::Fault(e) => Err(e),
        _ => Err(Error::user(ValueError("x"))),
    });
    let mut scheduler = Scheduler::new();
    let err = scheduler
        .run(gather_ints(vec![
            slow_add_one(Duration::from_millis(10), 1),
            raiser,
        ]))
        .unwrap_err();
    // The origin error comes back bare, not wrapped in a group.
    assert!(matches!(err, Error::User(_)));
    assert_eq!(err.downcast_ref::<ValueError>().unwrap().0, "x");
}

#[test]
fn test_failure_cancels_pending_sleepers_promptly() {
    let raiser = Coro::from_fn(|input| match input {
        Resume::Fault(e) => Err(e),
        _ => Err(Error::user(ValueError("fast"))),
    });
    let mut scheduler = Scheduler::new();
    let start = Instant::now();
    let err = scheduler
        .run(gather_ints(vec![
            slow_add_one(Duration::from_secs(30), 1),
            raiser,
        ]))
        .unwrap_err();
    assert_eq!(err.downcast_ref::<ValueError>().unwrap().0, "fast");
    // The 30s sleeper was cancelled, not waited out.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_event_wait_with_timeout_expires_unset() {
    let mut started = false;
    let root = Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if !started => {
            started = true;
            Ok(Step::Yield(
                Event::new().wait_timeout(Duration::from_millis(50)).into(),
            ))
        }
        Resume::Set(set) => Ok(Step::Done(Value::new(set))),
        _ => unreachable!(),
    });
    let mut scheduler = Scheduler::new();
    let start = Instant::now();
    let out = scheduler.run(root).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(out.downcast_ref::<bool>(), Some(&false));
    assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
}

#[test]
fn test_sleep_zero_completes_after_one_cycle() {
    let mut started = false;
    let root = Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if !started => {
            started = true;
            Ok(Step::Yield(sleep(Duration::ZERO).into()))
        }
        Resume::Set(set) => {
            assert!(!set);
            Ok(Step::Done(Value::new(1_i32)))
        }
        _ => unreachable!(),
    });
    let mut scheduler = Scheduler::new();
    let out = scheduler.run(root).unwrap();
    assert_eq!(out.downcast_ref::<i32>(), Some(&1));
}

#[test]
fn test_nested_loop_runs_inside_a_coroutine() {
    let root = Coro::from_fn(|input| match input {
        Resume::Fault(e) => Err(e),
        _ => {
            let mut inner = Scheduler::new();
            let out = inner
                .run(gather_ints(vec![
                    slow_add_one(Duration::from_millis(5), 1),
                    slow_add_one(Duration::from_millis(5), 2),
                ]))
                .unwrap();
            let total: i32 = out.downcast_ref::<Vec<i32>>().unwrap().iter().sum();
            Ok(Step::Done(Value::new(total)))
        }
    });
    let mut scheduler = Scheduler::new();
    let out = scheduler.run(root).unwrap();
    assert_eq!(out.downcast_ref::<i32>(), Some(&5));
}

#[test]
fn test_cancelled_sibling_may_catch_and_clean_up() {
    use std::cell::Cell;
    use std::rc::Rc;

    let cleaned = Rc::new(Cell::new(false));
    let flag = cleaned.clone();
    let sibling = {
        let mut cancelled = false;
        Coro::from_fn(move |input| match input {
            Resume::Fault(e) if !cancelled => {
                assert!(e.is_cancelled());
                cancelled = true;
                flag.set(true);
                Err(e)
            }
            Resume::Fault(e) => Err(e),
            _ => Ok(Step::Yield(sleep(Duration::from_secs(10)).into())),
        })
    };
    let raiser = Coro::from_fn(|input| match input {
        Resume::Fault(e) => Err(e),
        _ => Err(Error::user(ValueError("origin"))),
    });

    let mut scheduler = Scheduler::new();
    let err = scheduler
        .run(gather_ints(vec![sibling, raiser]))
        .unwrap_err();
    assert!(cleaned.get());
    assert_eq!(err.downcast_ref::<ValueError>().unwrap().0, "origin");
}
