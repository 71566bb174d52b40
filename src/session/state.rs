//! Session activity state
//!
//! What a session's engine is doing is one `Activity`, plus a handful of
//! independent flags. Legal moves between activities are listed in one
//! table (`Activity::can_enter`); lifecycle operations check it before
//! touching anything.

use crate::engine::TableError;
use crate::game::Move;
use crate::kernel::lock::LockError;
use crate::kernel::scheduler::SchedError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Automated play flavours sharing the AutoPlaying activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AutoPlayMode {
    /// Engine plays both sides until the game ends
    Plain,
    /// Like Plain, restarting the game each time it ends
    DemoPlay,
    /// A series of games with statistics
    EngineMatch,
    /// One search per position of the current game
    AnalyzeGame,
    /// AnalyzeGame over several games
    AnalyzeCollection,
    /// Test positions with known best moves
    AnalyzeEpd,
}

impl AutoPlayMode {
    /// Modes that play moves on the board (as opposed to analysing)
    pub fn plays_moves(self) -> bool {
        matches!(
            self,
            AutoPlayMode::Plain | AutoPlayMode::DemoPlay | AutoPlayMode::EngineMatch
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            AutoPlayMode::Plain => "plain",
            AutoPlayMode::DemoPlay => "demo",
            AutoPlayMode::EngineMatch => "match",
            AutoPlayMode::AnalyzeGame => "analyze-game",
            AutoPlayMode::AnalyzeCollection => "analyze-collection",
            AutoPlayMode::AnalyzeEpd => "analyze-epd",
        }
    }
}

/// What the session's engine is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    /// Foreground search for the side to move
    Thinking,
    /// Ponder search on the position after `expected`
    Backgrounding { expected: Move },
    /// Continuous analysis
    Monitoring,
    AutoPlaying(AutoPlayMode),
}

impl Activity {
    pub fn is_idle(&self) -> bool {
        matches!(self, Activity::Idle)
    }

    pub fn is_autoplay(&self) -> bool {
        matches!(self, Activity::AutoPlaying(_))
    }

    pub fn autoplay_mode(&self) -> Option<AutoPlayMode> {
        match self {
            Activity::AutoPlaying(mode) => Some(*mode),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_enter(&self, next: &Activity) -> bool {
        use Activity::*;
        match (self, next) {
            // Hard abort and normal completion
            (_, Idle) => true,
            (Idle, Thinking | Backgrounding { .. } | Monitoring | AutoPlaying(_)) => true,
            // Ponder hit
            (Backgrounding { .. }, Thinking) => true,
            (Thinking, Thinking | Backgrounding { .. } | Monitoring | AutoPlaying(_)) => false,
            (Backgrounding { .. }, Backgrounding { .. } | Monitoring | AutoPlaying(_)) => false,
            (Monitoring, Thinking | Backgrounding { .. } | Monitoring | AutoPlaying(_)) => false,
            (AutoPlaying(_), Thinking | Backgrounding { .. } | Monitoring | AutoPlaying(_)) => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activity::Idle => "idle",
            Activity::Thinking => "thinking",
            Activity::Backgrounding { .. } => "backgrounding",
            Activity::Monitoring => "monitoring",
            Activity::AutoPlaying(mode) => mode.name(),
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Backgrounding { expected } => write!(f, "backgrounding({})", expected),
            Activity::AutoPlaying(mode) => write!(f, "autoplay({})", mode.name()),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Modifiers that hold alongside the activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivityFlags {
    /// "Move now": the running search should finish early
    pub user_requested_stop: bool,
    pub has_resigned: bool,
    pub has_announced_mate: bool,
    pub draw_offered: bool,
    /// A fallen flag was reset instead of ending the game
    pub timeout_continued: bool,
}

impl ActivityFlags {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn any(&self) -> bool {
        *self != Self::default()
    }
}

/// Why a lifecycle operation was refused
///
/// Every refusal leaves the session exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The activity does not allow this transition
    AlreadyRunning { activity: &'static str },
    GameOver,
    LockDenied(LockError),
    NoHint,
    PermanentBrainOff,
    OtherEngineRunning,
    TableAllocation(TableError),
    NoTaskSlot(SchedError),
    /// The session's engine is searching and must be stopped first
    EngineThinking,
    /// The operation needs an activity that is not current
    NotActive,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::AlreadyRunning { activity } => write!(f, "engine is already {}", activity),
            TransitionError::GameOver => write!(f, "game is over"),
            TransitionError::LockDenied(e) => write!(f, "engine lock denied: {}", e),
            TransitionError::NoHint => write!(f, "no move to ponder on"),
            TransitionError::PermanentBrainOff => write!(f, "permanent brain is off"),
            TransitionError::OtherEngineRunning => write!(f, "another engine is running"),
            TransitionError::TableAllocation(e) => write!(f, "{}", e),
            TransitionError::NoTaskSlot(e) => write!(f, "cannot start search task: {}", e),
            TransitionError::EngineThinking => write!(f, "engine is thinking"),
            TransitionError::NotActive => write!(f, "mode is not active"),
        }
    }
}

impl std::error::Error for TransitionError {}

impl From<LockError> for TransitionError {
    fn from(e: LockError) -> Self {
        TransitionError::LockDenied(e)
    }
}

impl From<TableError> for TransitionError {
    fn from(e: TableError) -> Self {
        TransitionError::TableAllocation(e)
    }
}

impl From<SchedError> for TransitionError {
    fn from(e: SchedError) -> Self {
        TransitionError::NoTaskSlot(e)
    }
}

pub type TransitionResult<T> = Result<T, TransitionError>;
