//! Cooperative round-robin scheduler
//!
//! Runs N logical tasks on one thread with zero preemption:
//! - Fixed-capacity arena of task slots, reserved up front by `begin`
//! - One circular doubly-linked list of active tasks
//! - `switch().await` is the only suspension point
//! - Tasks that return (instead of yielding) are reaped by the resume loop
//!
//! A task's saved context is its suspended future. The resume loop polls
//! exactly one task per turn and then inspects how the turn ended:
//! `Pending` means the task yielded and the next task in the ring runs,
//! `Ready` means the task returned and its slot is reclaimed.
//!
//! Scheduler bookkeeping is never locked. Only the running task touches it,
//! either at a `switch` boundary or through `create`/`kill`, both of which
//! complete within the caller's turn.

use super::task::{Priority, Seeded, TaskFuture, TaskId, TurnEnd};
use super::trace::{self, SchedulerStats, TraceCategory};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Errors returned by scheduler operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// `begin` was asked for zero slots
    InvalidCapacity,
    /// The scheduler is not inside `run`
    NotRunning,
    /// `run` was called while already running
    AlreadyRunning,
    /// Every task slot is occupied
    CapacityExhausted,
}

impl std::fmt::Display for SchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedError::InvalidCapacity => write!(f, "scheduler capacity must be at least 1"),
            SchedError::NotRunning => write!(f, "scheduler is not running"),
            SchedError::AlreadyRunning => write!(f, "scheduler is already running"),
            SchedError::CapacityExhausted => write!(f, "no free task slot"),
        }
    }
}

impl std::error::Error for SchedError {}

pub type SchedResult<T> = Result<T, SchedError>;

/// One slot of the task arena
struct Slot {
    active: bool,
    priority: Priority,
    /// Successor in the active ring (self when unlinked)
    next: usize,
    /// Predecessor in the active ring (self when unlinked)
    prev: usize,
    /// Suspended task; `None` while the task is being resumed or when vacant
    context: Option<TaskFuture>,
    turns: u64,
    /// Bumped every time the slot is (re)initialised
    generation: u64,
    last_turn: Option<TurnEnd>,
}

impl Slot {
    fn vacant(index: usize) -> Self {
        Self {
            active: false,
            priority: Priority::Normal,
            next: index,
            prev: index,
            context: None,
            turns: 0,
            generation: 0,
            last_turn: None,
        }
    }

    /// A freshly initialised slot. Nothing from a previous occupant survives.
    fn fresh(index: usize, priority: Priority, generation: u64, context: Option<TaskFuture>) -> Self {
        Self {
            active: true,
            priority,
            next: index,
            prev: index,
            context,
            turns: 0,
            generation,
            last_turn: None,
        }
    }
}

struct Core {
    slots: Vec<Slot>,
    current: usize,
    active_count: usize,
    running: bool,
    stats: SchedulerStats,
}

impl Core {
    fn lowest_free(&self) -> Option<usize> {
        (1..self.slots.len()).find(|&i| !self.slots[i].active)
    }

    /// Splice `id` into the ring immediately after `anchor`
    fn link_after(&mut self, anchor: usize, id: usize) {
        let next = self.slots[anchor].next;
        self.slots[id].prev = anchor;
        self.slots[id].next = next;
        self.slots[anchor].next = id;
        self.slots[next].prev = id;
        self.active_count += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.active_count);
    }

    /// Remove `id` from the ring, returning its context so the caller can
    /// drop it once the core is no longer borrowed.
    fn unlink(&mut self, id: usize) -> Option<TaskFuture> {
        let prev = self.slots[id].prev;
        let next = self.slots[id].next;
        self.slots[prev].next = next;
        self.slots[next].prev = prev;

        let slot = &mut self.slots[id];
        slot.active = false;
        slot.next = id;
        slot.prev = id;
        self.active_count -= 1;
        slot.context.take()
    }
}

/// Handle to a cooperative scheduler
///
/// Cloning the handle is cheap; every clone refers to the same task arena.
/// Tasks receive a clone as the first argument of their entry function.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<RefCell<Core>>,
}

impl Scheduler {
    /// Reserve `capacity` task slots (the main task included)
    pub fn begin(capacity: usize) -> SchedResult<Scheduler> {
        if capacity == 0 {
            return Err(SchedError::InvalidCapacity);
        }

        let slots = (0..capacity).map(Slot::vacant).collect();
        trace::record(
            TraceCategory::Scheduler,
            "begin",
            Some(format!("capacity={}", capacity)),
        );

        Ok(Scheduler {
            core: Rc::new(RefCell::new(Core {
                slots,
                current: 0,
                active_count: 0,
                running: false,
                stats: SchedulerStats::new(),
            })),
        })
    }

    /// Release the task arena, dropping every task still stored in it
    pub fn end(self) {
        let contexts: Vec<TaskFuture> = {
            let mut core = self.core.borrow_mut();
            core.running = false;
            core.active_count = 0;
            core.slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.active = false;
                    slot.context.take()
                })
                .collect()
        };
        drop(contexts);
        trace::record(TraceCategory::Scheduler, "end", None);
    }

    /// Run `main` as task 0 until it returns
    ///
    /// When the main task returns, every other task still active is killed
    /// before this call returns, so no task outlives the scheduler run.
    pub fn run<F, P, Fut>(&self, main: F, payload: P, priority: Priority) -> SchedResult<()>
    where
        F: FnOnce(Scheduler, P) -> Fut + 'static,
        P: 'static,
        Fut: Future<Output = ()> + 'static,
    {
        {
            let mut core = self.core.borrow_mut();
            if core.running {
                return Err(SchedError::AlreadyRunning);
            }
            let generation = core.slots[0].generation.wrapping_add(1);
            let context: TaskFuture = Box::pin(Seeded::new(main, self.clone(), payload));
            core.slots[0] = Slot::fresh(0, priority, generation, Some(context));
            core.current = 0;
            core.active_count = 1;
            core.running = true;
            core.stats.tasks_created += 1;
            core.stats.peak_active = core.stats.peak_active.max(1);
        }
        trace::record(TraceCategory::Scheduler, "run", None);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            let (id, context) = {
                let mut core = self.core.borrow_mut();
                let id = core.current;
                core.stats.turns += 1;
                (id, core.slots[id].context.take())
            };

            // An active slot always holds its context between turns
            let Some(mut task) = context else {
                self.shutdown();
                break;
            };

            match task.as_mut().poll(&mut cx) {
                Poll::Pending => self.finish_yield(id, task),
                Poll::Ready(()) => {
                    drop(task);
                    if id == TaskId::MAIN.index() {
                        self.shutdown();
                        break;
                    }
                    self.reap(id);
                }
            }
        }

        Ok(())
    }

    /// The task yielded: store its context and advance to its successor
    fn finish_yield(&self, id: usize, task: TaskFuture) {
        let mut core = self.core.borrow_mut();
        if !core.slots[id].active {
            // The arena was released from inside the task's turn
            drop(core);
            drop(task);
            return;
        }
        let slot = &mut core.slots[id];
        slot.context = Some(task);
        slot.turns += 1;
        slot.last_turn = Some(TurnEnd::Yielded);
        core.current = core.slots[id].next;
    }

    /// The task returned: make its successor current, then unlink it
    fn reap(&self, id: usize) {
        let context = {
            let mut core = self.core.borrow_mut();
            if !core.slots[id].active {
                return;
            }
            core.current = core.slots[id].next;
            core.slots[id].turns += 1;
            core.slots[id].last_turn = Some(TurnEnd::Returned);
            core.stats.tasks_completed += 1;
            core.unlink(id)
        };
        drop(context);
        trace::record(TraceCategory::Scheduler, "reap", Some(format!("task={}", id)));
    }

    /// Kill every task except the main one, then stop
    fn shutdown(&self) {
        loop {
            let context = {
                let mut core = self.core.borrow_mut();
                if core.active_count <= 1 {
                    break;
                }
                let current = core.current;
                let victim = core.slots[current].next;
                core.stats.tasks_killed += 1;
                core.unlink(victim)
            };
            drop(context);
        }

        let mut core = self.core.borrow_mut();
        let main = TaskId::MAIN.index();
        core.slots[main].active = false;
        core.slots[main].last_turn = Some(TurnEnd::Returned);
        core.slots[main].context = None;
        core.active_count = 0;
        core.current = main;
        core.running = false;
        drop(core);
        trace::record(TraceCategory::Scheduler, "shutdown", None);
    }

    /// Create a task that runs `entry(scheduler, payload)` on its first turn
    ///
    /// The task takes the lowest free id and is spliced in right after the
    /// creating task, so it runs next in turn.
    pub fn create<F, P, Fut>(&self, entry: F, payload: P, priority: Priority) -> SchedResult<TaskId>
    where
        F: FnOnce(Scheduler, P) -> Fut + 'static,
        P: 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let id = {
            let mut core = self.core.borrow_mut();
            if !core.running {
                return Err(SchedError::NotRunning);
            }
            let Some(id) = core.lowest_free() else {
                core.stats.create_failures += 1;
                return Err(SchedError::CapacityExhausted);
            };

            let generation = core.slots[id].generation.wrapping_add(1);
            let context: TaskFuture = Box::pin(Seeded::new(entry, self.clone(), payload));
            core.slots[id] = Slot::fresh(id, priority, generation, Some(context));
            let anchor = core.current;
            core.link_after(anchor, id);
            core.stats.tasks_created += 1;
            id
        };

        trace::record(
            TraceCategory::Scheduler,
            "create",
            Some(format!("task={} priority={:?}", id, priority)),
        );
        Ok(TaskId(id))
    }

    /// Kill another task
    ///
    /// Returns false (and does nothing) for the running task, the main task,
    /// or a task that is not active. A task ends itself by returning.
    pub fn kill(&self, id: TaskId) -> bool {
        let context = {
            let mut core = self.core.borrow_mut();
            let idx = id.index();
            if !core.running
                || idx >= core.slots.len()
                || id.is_main()
                || idx == core.current
                || !core.slots[idx].active
            {
                return false;
            }
            core.stats.tasks_killed += 1;
            core.unlink(idx)
        };
        drop(context);
        trace::record(TraceCategory::Scheduler, "kill", Some(format!("task={}", id.0)));
        true
    }

    /// Yield the rest of this turn to the next task in the ring
    ///
    /// Completes immediately when the caller is the only active task.
    pub fn switch(&self) -> Switch {
        Switch {
            sched: self.clone(),
            yielded: false,
        }
    }

    /// The task whose turn it is
    pub fn current(&self) -> TaskId {
        TaskId(self.core.borrow().current)
    }

    pub fn is_running(&self) -> bool {
        self.core.borrow().running
    }

    pub fn capacity(&self) -> usize {
        self.core.borrow().slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.core.borrow().active_count
    }

    pub fn is_active(&self, id: TaskId) -> bool {
        self.core
            .borrow()
            .slots
            .get(id.index())
            .is_some_and(|slot| slot.active)
    }

    /// Successor of an active task in the ring
    pub fn next_of(&self, id: TaskId) -> Option<TaskId> {
        let core = self.core.borrow();
        core.slots
            .get(id.index())
            .filter(|slot| slot.active)
            .map(|slot| TaskId(slot.next))
    }

    /// Active tasks in turn order, starting with the current task
    pub fn active_ids(&self) -> Vec<TaskId> {
        let core = self.core.borrow();
        let mut ids = Vec::with_capacity(core.active_count);
        if core.active_count == 0 {
            return ids;
        }
        let mut at = core.current;
        for _ in 0..core.active_count {
            ids.push(TaskId(at));
            at = core.slots[at].next;
        }
        ids
    }

    pub fn priority(&self, id: TaskId) -> Option<Priority> {
        let core = self.core.borrow();
        core.slots
            .get(id.index())
            .filter(|slot| slot.active)
            .map(|slot| slot.priority)
    }

    /// Number of completed turns of an active task
    pub fn turns(&self, id: TaskId) -> Option<u64> {
        let core = self.core.borrow();
        core.slots
            .get(id.index())
            .filter(|slot| slot.active)
            .map(|slot| slot.turns)
    }

    /// How often a slot has been initialised
    pub fn generation(&self, id: TaskId) -> Option<u64> {
        self.core.borrow().slots.get(id.index()).map(|slot| slot.generation)
    }

    /// How the given slot's last turn ended
    pub fn last_turn(&self, id: TaskId) -> Option<TurnEnd> {
        self.core
            .borrow()
            .slots
            .get(id.index())
            .and_then(|slot| slot.last_turn)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.core.borrow().stats.clone()
    }

    /// Check the active ring: every member active and listed once, links
    /// consistent in both directions, and `active_count` steps from the
    /// current task lead back to it.
    pub fn verify_ring(&self) -> bool {
        let core = self.core.borrow();
        if core.active_count == 0 {
            return !core.running;
        }
        if !core.slots[core.current].active {
            return false;
        }

        let mut seen = vec![false; core.slots.len()];
        let mut at = core.current;
        for _ in 0..core.active_count {
            let slot = &core.slots[at];
            if !slot.active || seen[at] || core.slots[slot.next].prev != at {
                return false;
            }
            seen[at] = true;
            at = slot.next;
        }

        let listed = seen.iter().filter(|&&s| s).count();
        let active = core.slots.iter().filter(|s| s.active).count();
        at == core.current && listed == active
    }
}

/// Future returned by [`Scheduler::switch`]
#[must_use = "switch does nothing unless awaited"]
pub struct Switch {
    sched: Scheduler,
    yielded: bool,
}

impl Future for Switch {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        let mut core = self.sched.core.borrow_mut();
        if core.active_count <= 1 {
            // Nowhere else to go
            return Poll::Ready(());
        }
        core.stats.switches += 1;
        drop(core);

        self.yielded = true;
        Poll::Pending
    }
}
