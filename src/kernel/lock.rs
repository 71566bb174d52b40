//! Engine lock implementation
//!
//! One advisory, exclusive lock per engine identity. A session must hold the
//! lock for its engine before it may think, ponder, monitor or auto-play
//! with it.
//!
//! Acquisition never blocks and never queues: a held lock fails the request
//! with `WouldBlock` and the caller decides what to do (usually: stay Idle).
//! All locks are advisory - they coordinate cooperating sessions, they do
//! not stop anyone from calling into an engine.

use super::trace::{self, TraceCategory};
use crate::engine::EngineId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Identifies the session that owns a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub usize);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

/// A held engine lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLock {
    /// Engine being driven
    pub engine: EngineId,
    /// Session holding the lock
    pub owner: SessionId,
}

/// Error types for locking operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Another session holds the lock (EWOULDBLOCK)
    WouldBlock { holder: SessionId },
    /// Release by a session that does not hold the lock
    NotHeld,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::WouldBlock { holder } => write!(f, "engine is in use by {}", holder),
            LockError::NotHeld => write!(f, "engine lock not held"),
        }
    }
}

impl std::error::Error for LockError {}

/// Engine lock table
///
/// Tracks which session currently drives each engine.
#[derive(Debug, Default)]
pub struct EngineLockTable {
    locks: HashMap<EngineId, SessionId>,
}

/// Lock table shared by every session of an app
pub type SharedLocks = Rc<RefCell<EngineLockTable>>;

impl EngineLockTable {
    pub fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    pub fn shared() -> SharedLocks {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Try to take the lock for `engine`
    ///
    /// Re-acquiring a lock the owner already holds succeeds.
    pub fn acquire(&mut self, engine: EngineId, owner: SessionId) -> Result<EngineLock, LockError> {
        if let Some(&holder) = self.locks.get(&engine) {
            if holder == owner {
                return Ok(EngineLock { engine, owner });
            }
            trace::record_session(
                TraceCategory::Lock,
                owner.0,
                "denied",
                Some(format!("{} held by {}", engine, holder)),
            );
            return Err(LockError::WouldBlock { holder });
        }

        self.locks.insert(engine, owner);
        trace::record_session(TraceCategory::Lock, owner.0, "acquire", Some(engine.to_string()));
        Ok(EngineLock { engine, owner })
    }

    /// Release the lock for `engine` if `owner` holds it
    pub fn release(&mut self, engine: EngineId, owner: SessionId) -> Result<(), LockError> {
        match self.locks.get(&engine) {
            Some(&holder) if holder == owner => {
                self.locks.remove(&engine);
                trace::record_session(TraceCategory::Lock, owner.0, "release", Some(engine.to_string()));
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }

    /// Release every lock held by a session (called when a session closes)
    pub fn release_all(&mut self, owner: SessionId) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, holder| *holder != owner);
        before - self.locks.len()
    }

    /// Current holder of an engine's lock
    pub fn holder(&self, engine: EngineId) -> Option<SessionId> {
        self.locks.get(&engine).copied()
    }

    /// Whether any session other than `owner` is driving an engine
    pub fn others_running(&self, owner: SessionId) -> bool {
        self.locks.values().any(|holder| *holder != owner)
    }

    pub fn held_count(&self) -> usize {
        self.locks.len()
    }
}
