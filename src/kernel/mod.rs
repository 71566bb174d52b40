//! The kernel - task scheduling and the services sessions share
//!
//! - Tasks are futures in a fixed arena, run round-robin on one thread
//! - A task only loses the CPU where it awaits `switch()`
//! - Everything a task touches between switches is effectively atomic

pub mod clock;
pub mod lock;
pub mod msgqueue;
pub mod scheduler;
pub mod task;
pub mod trace;


pub use clock::{ChessClock, TimeControl};
pub use lock::{EngineLockTable, LockError, SessionId, SharedLocks};
pub use msgqueue::{EngineMessages, MessagePort};
pub use scheduler::{SchedError, SchedResult, Scheduler};
pub use task::{Priority, TaskId};
