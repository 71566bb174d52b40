//! Engine sessions
//!
//! A session is one game plus the engine working on it (a game window in a
//! desktop app). It owns the activity state machine: which search is
//! running, for what purpose, under which lock, and what happens to its
//! result.
//!
//! Sessions live on the main task. Search drivers run as separate tasks and
//! only talk back through the session's message port, which the main loop
//! drains once per turn via `on_idle_tick`.

pub mod autoplay;
pub mod driver;
mod lifecycle;
pub mod state;

pub use autoplay::{AutoPlay, AutoPlayReport, Annotation, EpdRecord, MatchStats};
pub use state::{Activity, ActivityFlags, AutoPlayMode, TransitionError, TransitionResult};

use crate::config::SessionConfig;
use crate::engine::{EngineId, SearchId, SearchResult, SharedEngine, SharedTables};
use crate::game::{Color, Game, GameResult, Move};
use crate::kernel::clock::ChessClock;
use crate::kernel::lock::SharedLocks;
pub use crate::kernel::lock::SessionId;
use crate::kernel::msgqueue::{EngineMessages, MessagePort};
use crate::kernel::task::TaskId;
use crate::platform::SharedTime;
use driver::DriverSignal;
use std::rc::Rc;

/// Resources shared by every session of an app
#[derive(Clone)]
pub struct SessionEnv {
    pub locks: SharedLocks,
    pub tables: SharedTables,
    pub time: SharedTime,
}

/// Receives what a session reports while it is ticked
///
/// Every method has an empty default, so an observer only implements what
/// it displays.
pub trait SessionObserver {
    /// One pending engine event, delivered once per drain
    fn on_message(&mut self, _session: SessionId, _message: EngineMessages) {}

    fn on_move_played(&mut self, _session: SessionId, _mv: Move) {}

    fn on_game_over(&mut self, _session: SessionId, _result: GameResult) {}

    fn on_activity_changed(&mut self, _session: SessionId, _from: Activity, _to: Activity) {}

    fn on_autoplay_finished(&mut self, _session: SessionId, _report: &AutoPlayReport) {}
}

/// Observer that ignores everything
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// Something a session reported, as recorded by `EventLog`
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(EngineMessages),
    MovePlayed(Move),
    GameOver(GameResult),
    ActivityChanged { from: Activity, to: Activity },
    AutoPlayFinished(AutoPlayReport),
}

/// Observer that keeps every report in order
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<(SessionId, SessionEvent)>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(&self, session: SessionId) -> impl Iterator<Item = &SessionEvent> {
        self.events
            .iter()
            .filter(move |(id, _)| *id == session)
            .map(|(_, event)| event)
    }

    pub fn take(&mut self) -> Vec<(SessionId, SessionEvent)> {
        std::mem::take(&mut self.events)
    }
}

impl SessionObserver for EventLog {
    fn on_message(&mut self, session: SessionId, message: EngineMessages) {
        self.events.push((session, SessionEvent::Message(message)));
    }

    fn on_move_played(&mut self, session: SessionId, mv: Move) {
        self.events.push((session, SessionEvent::MovePlayed(mv)));
    }

    fn on_game_over(&mut self, session: SessionId, result: GameResult) {
        self.events.push((session, SessionEvent::GameOver(result)));
    }

    fn on_activity_changed(&mut self, session: SessionId, from: Activity, to: Activity) {
        self.events.push((session, SessionEvent::ActivityChanged { from, to }));
    }

    fn on_autoplay_finished(&mut self, session: SessionId, report: &AutoPlayReport) {
        self.events.push((session, SessionEvent::AutoPlayFinished(report.clone())));
    }
}

/// Purpose of a running search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchKind {
    /// Foreground move search
    Think,
    /// Search on the position after the expected reply
    Ponder,
    /// One pass of continuous analysis
    Monitor,
    /// One search of an automated run
    Auto,
}

/// The search a session is currently running
struct ActiveSearch {
    id: SearchId,
    kind: SearchKind,
    task: TaskId,
    signal: Rc<DriverSignal>,
    engine: SharedEngine,
    engine_id: EngineId,
    /// Side the engine searches for
    side: Color,
    /// Whether the side's clock runs during this search
    timed: bool,
    started_at: f64,
}

/// A game and the engine working on it
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    env: SessionEnv,
    engine: SharedEngine,
    engine_id: EngineId,
    /// Second engine for matches
    opponent: Option<(SharedEngine, EngineId)>,

    activity: Activity,
    flags: ActivityFlags,
    game: Game,
    clock: ChessClock,
    port: MessagePort,

    search: Option<ActiveSearch>,
    next_serial: u64,
    /// Engine locks this session holds
    held: Vec<EngineId>,
    /// Expected reply from the last completed search
    hint: Option<Move>,
    last_result: Option<SearchResult>,
    /// Set right after the engine moved, while pondering is allowed
    just_moved: bool,

    autoplay: Option<AutoPlay>,
    last_report: Option<AutoPlayReport>,
    /// Reports not yet delivered to an observer
    outbox: Vec<SessionEvent>,
}

impl Session {
    pub fn new(id: SessionId, engine: SharedEngine, env: SessionEnv, config: SessionConfig) -> Self {
        let engine_id = engine.borrow().id();
        let clock = ChessClock::new(config.time_control);
        Self {
            id,
            config,
            env,
            engine,
            engine_id,
            opponent: None,
            activity: Activity::Idle,
            flags: ActivityFlags::default(),
            game: Game::new(),
            clock,
            port: MessagePort::new(),
            search: None,
            next_serial: 1,
            held: Vec::new(),
            hint: None,
            last_result: None,
            just_moved: false,
            autoplay: None,
            last_report: None,
            outbox: Vec::new(),
        }
    }

    /// Engine playing the other colour in engine matches
    pub fn set_opponent(&mut self, engine: SharedEngine) {
        let id = engine.borrow().id();
        self.opponent = Some((engine, id));
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn flags(&self) -> ActivityFlags {
        self.flags
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn clock(&self) -> &ChessClock {
        &self.clock
    }

    pub fn hint(&self) -> Option<Move> {
        self.hint
    }

    /// Result of the last search that completed normally
    pub fn last_result(&self) -> Option<&SearchResult> {
        self.last_result.as_ref()
    }

    /// Serial of the running search
    pub fn search_id(&self) -> Option<SearchId> {
        self.search.as_ref().map(|s| s.id)
    }

    /// Scheduler task driving the running search
    pub fn search_task(&self) -> Option<TaskId> {
        self.search.as_ref().map(|s| s.task)
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    pub fn holds_lock(&self) -> bool {
        !self.held.is_empty()
    }

    pub fn autoplay(&self) -> Option<&AutoPlay> {
        self.autoplay.as_ref()
    }

    /// Report of the last automated run that finished
    pub fn last_report(&self) -> Option<&AutoPlayReport> {
        self.last_report.as_ref()
    }

    fn now(&self) -> f64 {
        self.env.time.now_ms()
    }

    /// Deliver queued reports (moves, results, activity changes) to
    /// `observer`, oldest first
    pub fn flush_events(&mut self, observer: &mut dyn SessionObserver) {
        for event in std::mem::take(&mut self.outbox) {
            match event {
                SessionEvent::Message(message) => observer.on_message(self.id, message),
                SessionEvent::MovePlayed(mv) => observer.on_move_played(self.id, mv),
                SessionEvent::GameOver(result) => observer.on_game_over(self.id, result),
                SessionEvent::ActivityChanged { from, to } => observer.on_activity_changed(self.id, from, to),
                SessionEvent::AutoPlayFinished(report) => observer.on_autoplay_finished(self.id, &report),
            }
        }
    }
}
