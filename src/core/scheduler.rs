/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use log::debug;

use crate::core::Core;

pub type OpId = usize;

pub enum Task {
    /// Re-enter a registered operation.  Posting is idempotent: a second
    /// post for an operation that is already queued is dropped.
    RunOp(OpId),
    Call(Box<dyn FnOnce(&Rc<Core>)>),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

struct TimerEnt {
    deadline: Instant,
    id: TimerId,
    generation: u64,
    /// Periodic when `Some`, one-shot when `None`.
    interval: Option<Duration>,
}

impl PartialEq for TimerEnt {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEnt {}
impl PartialOrd for TimerEnt {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEnt {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap by deadline
        other.deadline.cmp(&self.deadline)
    }
}

struct TimerSlot {
    generation: u64,
    active: bool,
    func: Option<Rc<dyn Fn(&Rc<Core>)>>,
}

/// Single-threaded cooperative scheduler: a FIFO task queue plus a timer
/// heap.  All operations, stage callbacks and completion continuations run
/// on the thread that called [`Scheduler::run`].
pub struct Scheduler {
    tasks: RefCell<VecDeque<Task>>,
    queued_ops: RefCell<Vec<OpId>>,
    timers: RefCell<BinaryHeap<TimerEnt>>,
    timer_slots: RefCell<Vec<TimerSlot>>,
    exit_code: Cell<Option<i32>>,
    now: Cell<Instant>,
    utc: Cell<SystemTime>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: RefCell::new(VecDeque::new()),
            queued_ops: RefCell::new(Vec::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_slots: RefCell::new(Vec::new()),
            exit_code: Cell::new(None),
            now: Cell::new(Instant::now()),
            utc: Cell::new(SystemTime::now()),
        }
    }

    pub fn post(&self, task: Task) {
        if let Task::RunOp(id) = task {
            let mut queued = self.queued_ops.borrow_mut();
            if queued.contains(&id) {
                debug!("task: op #{} already queued", id);
                return;
            }
            queued.push(id);
        }
        self.tasks.borrow_mut().push_back(task);
    }

    pub fn post_fn(&self, f: impl FnOnce(&Rc<Core>) + 'static) {
        self.post(Task::Call(Box::new(f)));
    }

    pub fn new_timer(&self) -> TimerId {
        let mut slots = self.timer_slots.borrow_mut();
        slots.push(TimerSlot {
            generation: 0,
            active: false,
            func: None,
        });
        TimerId(slots.len() - 1)
    }

    /// `interval_msec` > 0: periodic; < 0: one-shot after `|interval_msec|`;
    /// = 0: cancel.
    pub fn timer_set(&self, id: TimerId, interval_msec: i64, func: impl Fn(&Rc<Core>) + 'static) {
        debug!("timer: #{} {}ms", id.0, interval_msec);
        let mut slots = self.timer_slots.borrow_mut();
        let slot = &mut slots[id.0];
        slot.generation += 1;
        if interval_msec == 0 {
            slot.active = false;
            slot.func = None;
            return;
        }
        let ivl = Duration::from_millis(interval_msec.unsigned_abs());
        slot.active = true;
        slot.func = Some(Rc::new(func));
        self.timers.borrow_mut().push(TimerEnt {
            deadline: Instant::now() + ivl,
            id,
            generation: slot.generation,
            interval: (interval_msec > 0).then_some(ivl),
        });
    }

    pub fn exit(&self, code: i32) {
        if self.exit_code.get().is_none() {
            self.exit_code.set(Some(code));
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    #[cfg(test)]
    pub fn has_queued_op(&self, id: OpId) -> bool {
        self.queued_ops.borrow().contains(&id)
    }

    /// UTC wall-clock time, consistent within a single loop tick.
    pub fn utc(&self) -> SystemTime {
        self.utc.get()
    }

    fn tick(&self) {
        self.now.set(Instant::now());
        self.utc.set(SystemTime::now());
    }

    fn run_due_timers(&self, core: &Rc<Core>) -> Option<Instant> {
        loop {
            let ent = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    None => return None,
                    Some(top) if top.deadline > self.now.get() => return Some(top.deadline),
                    Some(_) => timers.pop().unwrap(),
                }
            };
            let func = {
                let slots = self.timer_slots.borrow();
                let slot = &slots[ent.id.0];
                if !slot.active || slot.generation != ent.generation {
                    continue; // cancelled or re-armed
                }
                slot.func.clone()
            };
            if let Some(ivl) = ent.interval {
                self.timers.borrow_mut().push(TimerEnt {
                    deadline: ent.deadline + ivl,
                    ..ent
                });
            } else {
                self.timer_slots.borrow_mut()[ent.id.0].active = false;
            }
            if let Some(f) = func {
                f(core);
            }
        }
    }

    /// Runs until [`Scheduler::exit`]; returns the exit code.
    pub fn run(&self, core: &Rc<Core>) -> i32 {
        debug!("scheduler: started");
        loop {
            self.tick();

            if let Some(code) = self.exit_code.get() {
                debug!("scheduler: exiting with code {}", code);
                return code;
            }

            let next_deadline = self.run_due_timers(core);

            let mut n = 0u32;
            loop {
                let task = self.tasks.borrow_mut().pop_front();
                let Some(task) = task else { break };
                match task {
                    Task::RunOp(id) => {
                        self.queued_ops.borrow_mut().retain(|&q| q != id);
                        core.com.run_op(core, id);
                    }
                    Task::Call(f) => f(core),
                }
                n += 1;
                if self.exit_code.get().is_some() {
                    break;
                }
            }
            if n != 0 {
                debug!("scheduler: processed {} tasks", n);
                continue;
            }

            if self.exit_code.get().is_some() {
                continue;
            }

            match next_deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if dl > now {
                        std::thread::sleep(dl - now);
                    }
                }
                None => {
                    // Nothing queued, no timers and no exit request: with a
                    // single-threaded loop no external wakeup can arrive.
                    log::error!("scheduler: idle with no pending work");
                    return 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    #[test]
    fn test_tasks_run_in_post_order() {
        let core = Core::new_for_tests();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            core.sched.post_fn(move |_| order.borrow_mut().push(i));
        }
        core.sched.post_fn(|core| core.sched.exit(0));
        assert_eq!(0, core.sched.run(&core));
        assert_eq!(vec![0, 1, 2], *order.borrow());
    }

    #[test]
    fn test_op_post_idempotent() {
        let core = Core::new_for_tests();
        core.sched.post(Task::RunOp(7));
        core.sched.post(Task::RunOp(7));
        assert_eq!(1, core.sched.tasks.borrow().len());
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let core = Core::new_for_tests();
        let hits = Rc::new(Cell::new(0u32));
        let t = core.sched.new_timer();
        let hits2 = hits.clone();
        core.sched.timer_set(t, -1, move |core| {
            hits2.set(hits2.get() + 1);
            core.sched.exit(0);
        });
        assert_eq!(0, core.sched.run(&core));
        assert_eq!(1, hits.get());
    }

    #[test]
    fn test_timer_cancel() {
        let core = Core::new_for_tests();
        let t = core.sched.new_timer();
        core.sched.timer_set(t, -1, |_| panic!("cancelled timer fired"));
        core.sched.timer_set(t, 0, |_| ());
        core.sched.post_fn(|core| core.sched.exit(0));
        assert_eq!(0, core.sched.run(&core));
    }

    #[test]
    fn test_exit_is_idempotent() {
        let core = Core::new_for_tests();
        core.sched.exit(3);
        core.sched.exit(5);
        assert_eq!(3, core.sched.run(&core));
    }
}
