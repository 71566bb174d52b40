//! External engine contracts
//!
//! The lifecycle drives engines through the `Engine` trait: start a search,
//! step it one bounded unit of work per scheduler turn, and poll the result
//! once it stops running. How an engine actually searches is its own
//! business; `ReplayEngine` is a scripted stand-in used by the CLI and the
//! tests.
//!
//! Transposition tables are a separate resource with a strict lifecycle:
//! allocated when a search starts, released when it ends, and left alone on
//! a ponder hit.

pub mod replay;

pub use replay::ReplayEngine;

use crate::game::{Color, Move, PositionSnapshot};
use crate::kernel::msgqueue::EngineMessages;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Identity of an underlying engine. Two sessions using the same identity
/// share one engine and must not drive it at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u32);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine({})", self.0)
    }
}

/// Serial of one search, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchId(pub u64);

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Centipawn score from the side to move's point of view
pub type Score = i32;

/// Score of a forced mate; mate in n is reported as `MATE_SCORE - n`
pub const MATE_SCORE: Score = 30_000;

/// Whether a score announces a forced mate (for either side)
pub fn is_mate_score(score: Score) -> bool {
    score.unsigned_abs() >= (MATE_SCORE - 1000).unsigned_abs()
}

/// Parameters handed to an engine when a search starts
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub id: SearchId,
    pub position: PositionSnapshot,
    /// Side the engine is searching for
    pub side: Color,
    /// Search the position as a ponder search: do not finish until
    /// `ponder_hit` or `stop`
    pub ponder: bool,
    /// Time budget for this move, `None` for no limit
    pub move_time_ms: Option<f64>,
}

/// Outcome of a finished search
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResult {
    /// `None` when the side to move has no legal move
    pub best_move: Option<Move>,
    pub score: Score,
    pub main_line: Vec<Move>,
    pub depth: u32,
    pub nodes: u64,
}

impl SearchResult {
    /// Expected reply to the best move, used for pondering
    pub fn hint(&self) -> Option<Move> {
        self.main_line.get(1).copied()
    }
}

/// Report of one `Engine::step`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepStatus {
    /// What changed during the step
    pub changes: EngineMessages,
    /// The search stopped running during this step
    pub finished: bool,
}

impl StepStatus {
    pub fn working(changes: EngineMessages) -> Self {
        Self {
            changes,
            finished: false,
        }
    }

    pub fn done(changes: EngineMessages) -> Self {
        Self {
            changes,
            finished: true,
        }
    }
}

/// Search control of an external engine
pub trait Engine {
    fn id(&self) -> EngineId;

    fn name(&self) -> &str;

    /// Begin searching. Any search the engine was still running is dropped.
    fn start(&mut self, request: SearchRequest);

    /// Finish as soon as possible, keeping the best move found so far
    fn stop(&mut self, id: SearchId);

    /// Drop the search; it reports no result
    fn abort(&mut self, id: SearchId);

    /// The expected move was played: turn the ponder search into a normal one
    fn ponder_hit(&mut self, id: SearchId);

    /// Do one bounded unit of work
    fn step(&mut self, id: SearchId) -> StepStatus;

    fn is_running(&self, id: SearchId) -> bool;

    fn was_aborted(&self, id: SearchId) -> bool;

    /// Result of a search that finished without being aborted
    fn result(&self, id: SearchId) -> Option<SearchResult>;
}

/// Engine shared between a session and its search driver
pub type SharedEngine = Rc<RefCell<dyn Engine>>;

/// Error from allocating a transposition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// The memory budget cannot fit another table
    OutOfMemory { requested_mb: usize, available_mb: usize },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::OutOfMemory {
                requested_mb,
                available_mb,
            } => write!(
                f,
                "cannot allocate {} MB transposition table ({} MB available)",
                requested_mb, available_mb
            ),
        }
    }
}

impl std::error::Error for TableError {}

/// Transposition table memory, paired with search start and end
pub trait TransTables {
    fn allocate(&mut self, engine: EngineId) -> Result<(), TableError>;

    fn deallocate(&mut self, engine: EngineId);

    fn is_allocated(&self, engine: EngineId) -> bool;
}

pub type SharedTables = Rc<RefCell<dyn TransTables>>;

/// Transposition tables carved from a fixed memory budget
///
/// Every engine gets a table of `table_mb`; allocation fails once the
/// budget is used up.
#[derive(Debug, Clone)]
pub struct SizedTransTables {
    budget_mb: usize,
    table_mb: usize,
    tables: HashMap<EngineId, usize>,
    allocations: u64,
    deallocations: u64,
}

impl SizedTransTables {
    pub fn new(budget_mb: usize, table_mb: usize) -> Self {
        Self {
            budget_mb,
            table_mb,
            tables: HashMap::new(),
            allocations: 0,
            deallocations: 0,
        }
    }

    pub fn shared(budget_mb: usize, table_mb: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(budget_mb, table_mb)))
    }

    pub fn used_mb(&self) -> usize {
        self.tables.values().sum()
    }

    pub fn live_tables(&self) -> usize {
        self.tables.len()
    }

    /// Successful allocations since creation
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn deallocations(&self) -> u64 {
        self.deallocations
    }
}

impl TransTables for SizedTransTables {
    fn allocate(&mut self, engine: EngineId) -> Result<(), TableError> {
        if self.tables.contains_key(&engine) {
            return Ok(());
        }
        let available = self.budget_mb.saturating_sub(self.used_mb());
        if self.table_mb > available {
            return Err(TableError::OutOfMemory {
                requested_mb: self.table_mb,
                available_mb: available,
            });
        }
        self.tables.insert(engine, self.table_mb);
        self.allocations += 1;
        Ok(())
    }

    fn deallocate(&mut self, engine: EngineId) {
        if self.tables.remove(&engine).is_some() {
            self.deallocations += 1;
        }
    }

    fn is_allocated(&self, engine: EngineId) -> bool {
        self.tables.contains_key(&engine)
    }
}
