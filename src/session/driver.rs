//! Search driver task
//!
//! Every running search is driven by its own scheduler task. Each turn the
//! driver checks the abort flag, asks the engine for one bounded unit of
//! work, posts what changed to the session's port and yields. It ends its
//! turn by returning once the search is finished or aborted; the scheduler
//! then reclaims the slot.

use crate::engine::{SearchId, SharedEngine};
use crate::kernel::msgqueue::MessagePort;
use crate::kernel::scheduler::Scheduler;
use std::cell::Cell;
use std::rc::Rc;

/// Flags shared between a session and its driver
#[derive(Debug, Default)]
pub struct DriverSignal {
    abort: Cell<bool>,
    exited: Cell<bool>,
}

impl DriverSignal {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Ask the driver to abort on its next turn
    pub fn request_abort(&self) {
        self.abort.set(true);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.get()
    }

    /// Whether the driver has unwound (returned or been killed)
    pub fn has_exited(&self) -> bool {
        self.exited.get()
    }
}

/// Marks the driver exited when dropped, whether the task returned, was
/// killed, or never got its first turn
struct ExitGuard(Rc<DriverSignal>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited.set(true);
    }
}

/// Everything a driver task owns
pub struct DriverJob {
    engine: SharedEngine,
    id: SearchId,
    port: MessagePort,
    guard: ExitGuard,
}

impl DriverJob {
    pub fn new(engine: SharedEngine, id: SearchId, port: MessagePort, signal: Rc<DriverSignal>) -> Self {
        Self {
            engine,
            id,
            port,
            guard: ExitGuard(signal),
        }
    }
}

/// Task entry: step the engine until the search finishes or is aborted
pub async fn search_driver(sched: Scheduler, job: DriverJob) {
    let DriverJob {
        engine,
        id,
        port,
        guard,
    } = job;

    loop {
        if guard.0.abort_requested() {
            engine.borrow_mut().abort(id);
            return;
        }

        let status = engine.borrow_mut().step(id);
        port.post(status.changes);
        if status.finished {
            port.post_done(id.0);
            return;
        }

        sched.switch().await;
    }
}
