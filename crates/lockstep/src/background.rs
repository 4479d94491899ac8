//! Awaiting gathered coroutines in completion order.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::coro::{Coro, Resume, Step, Yielded};
use crate::event::Event;
use crate::value::Value;

/// Split `coros` into a spawner plus one slot per input.
///
/// Yield the spawner first: it registers a wrapper for every input in the
/// background. Then await the slots in order; slot `i` completes with the
/// value of the `i`-th input *to finish*, whichever input that turns out to
/// be. Awaiting a slot without having yielded the spawner deadlocks the
/// loop.
pub fn as_completed(coros: Vec<Coro>) -> (Coro, Vec<Coro>) {
    let n = coros.len();
    let outs: Rc<RefCell<Vec<Option<Value>>>> = Rc::new(RefCell::new(vec![None; n]));
    let filled: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let gates: Vec<Event> = (0..n).map(|_| Event::new()).collect();

    let wrappers: Vec<Coro> = coros
        .into_iter()
        .map(|coro| {
            let outs = outs.clone();
            let filled = filled.clone();
            let gates = gates.clone();
            let mut started = false;
            Coro::from_fn(move |input| match input {
                Resume::Fault(e) => Err(e),
                Resume::Value(value) if started => {
                    let slot = filled.get();
                    filled.set(slot + 1);
                    outs.borrow_mut()[slot] = Some(value);
                    gates[slot].set();
                    Ok(Step::Done(Value::absent()))
                }
                _ => {
                    started = true;
                    Ok(Step::Yield(Yielded::Await(coro.clone())))
                }
            })
        })
        .collect();

    let mut spawned = false;
    let spawner = Coro::from_fn(move |input| match input {
        Resume::Fault(e) => Err(e),
        _ if !spawned => {
            spawned = true;
            Ok(Step::Yield(Yielded::Spawn(wrappers.clone())))
        }
        _ => Ok(Step::Done(Value::absent())),
    });

    let slots = (0..n)
        .map(|slot| {
            let outs = outs.clone();
            let gate = gates[slot].clone();
            let mut started = false;
            Coro::from_fn(move |input| match input {
                Resume::Fault(e) => Err(e),
                _ if !started => {
                    started = true;
                    Ok(Step::Yield(gate.wait().into()))
                }
                _ => {
                    let value = outs.borrow()[slot].clone().unwrap_or_else(Value::absent);
                    Ok(Step::Done(value))
                }
            })
        })
        .collect();

    (spawner, slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::time::sleep;
    use std::time::Duration;

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

    /// Yields the spawner, then drains each slot in order.
    fn drain_in_completion_order(spawner: Coro, slots: Vec<Coro>) -> Coro {
        let mut stage = 0_usize;
        let mut seen: Vec<i32> = Vec::new();
        Coro::from_fn(move |input| {
            if let Resume::Fault(e) = input {
                return Err(e);
            }
            if let Resume::Value(value) = &input {
                // The spawner completes with an absent value; skip it.
                if let Some(v) = value.downcast_ref::<i32>() {
                    seen.push(*v);
                }
            }
            if stage == 0 {
                stage = 1;
                return Ok(Step::Yield(Yielded::Await(spawner.clone())));
            }
            if stage <= slots.len() {
                let slot = slots[stage - 1].clone();
                stage += 1;
                return Ok(Step::Yield(Yielded::Await(slot)));
            }
            Ok(Step::Done(Value::new(seen.clone())))
        })
    }

    #[test]
    fn test_slots_complete_in_completion_order() {
        let inputs = vec![
            slow_value(Duration::from_millis(70), 7),
            slow_value(Duration::from_millis(10), 2),
            slow_value(Duration::from_millis(40), 4),
        ];
        let (spawner, slots) = as_completed(inputs);

        let mut scheduler = Scheduler::new();
        let out = scheduler
            .run(drain_in_completion_order(spawner, slots))
            .unwrap();
        assert_eq!(*out.downcast_ref::<Vec<i32>>().unwrap(), vec![2, 4, 7]);
    }

    #[test]
    fn test_empty_input() {
        let (spawner, slots) = as_completed(Vec::new());
        assert!(slots.is_empty());
        let mut scheduler = Scheduler::new();
        scheduler.run(spawner).unwrap();
    }

    #[test]
    fn test_immediate_inputs_keep_arrival_order() {
        let inputs = vec![Coro::ready(Value::new(1_i32)), Coro::ready(Value::new(2_i32))];
        let (spawner, slots) = as_completed(inputs);
        let mut scheduler = Scheduler::new();
        let out = scheduler
            .run(drain_in_completion_order(spawner, slots))
            .unwrap();
        assert_eq!(*out.downcast_ref::<Vec<i32>>().unwrap(), vec![1, 2]);
    }
}
