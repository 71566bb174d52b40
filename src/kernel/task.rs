//! Task abstraction
//!
//! A Task is the unit of execution in knightly. Tasks are cooperative: a
//! task keeps the thread until it calls `Scheduler::switch().await` or its
//! entry future completes. There is no preemption anywhere.

use futures::future::LocalBoxFuture;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Slot index of a task in the scheduler's fixed arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    /// The main task, created by `Scheduler::run`
    pub const MAIN: TaskId = TaskId(0);

    pub fn index(self) -> usize {
        self.0
    }

    pub fn is_main(self) -> bool {
        self == Self::MAIN
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task priority hint
///
/// Advisory only. The scheduler records it and reports it, but turn order
/// is strictly round robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// The UI loop
    Interactive = 0,
    /// Foreground engine work
    #[default]
    Normal = 1,
    /// Pondering and other speculative work
    Background = 2,
}

impl Priority {
    /// Map a raw level (as used by callers that think in numbers) to a hint
    pub fn from_level(level: u8) -> Self {
        match level {
            0..=3 => Priority::Interactive,
            4..=6 => Priority::Normal,
            _ => Priority::Background,
        }
    }
}

/// How a task's most recent turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// The task called `switch` (or otherwise suspended) and can be resumed
    Yielded,
    /// The task's entry future completed
    Returned,
}

/// The saved context of a task: its suspended entry future
pub type TaskFuture = LocalBoxFuture<'static, ()>;

pin_project! {
    /// A task that has been created but not yet resumed.
    ///
    /// The entry function is only called on the first resume, so a freshly
    /// created task begins execution at its function entry.
    #[project = SeededProj]
    pub enum Seeded<F, A, P, Fut> {
        Waiting { entry: Option<(F, A, P)> },
        Started { #[pin] fut: Fut },
    }
}

impl<F, A, P, Fut> Seeded<F, A, P, Fut> {
    pub fn new(entry: F, arg: A, payload: P) -> Self {
        Seeded::Waiting {
            entry: Some((entry, arg, payload)),
        }
    }

    /// Whether the entry function has been called yet
    pub fn has_started(&self) -> bool {
        matches!(self, Seeded::Started { .. })
    }
}

impl<F, A, P, Fut> Future for Seeded<F, A, P, Fut>
where
    F: FnOnce(A, P) -> Fut,
    Fut: Future<Output = ()>,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match self.as_mut().project() {
                SeededProj::Waiting { entry } => match entry.take() {
                    Some((f, arg, payload)) => {
                        let fut = f(arg, payload);
                        self.set(Seeded::Started { fut });
                    }
                    // Entry already consumed without starting: nothing left to run
                    None => return Poll::Ready(()),
                },
                SeededProj::Started { fut } => return fut.poll(cx),
            }
        }
    }
}
