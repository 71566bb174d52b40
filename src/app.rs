//! Application main loop
//!
//! The app owns every session and runs as the scheduler's main task. Each
//! turn it:
//! 1. Hands queued user commands to their sessions
//! 2. Ticks every session (clocks, engine messages, completed searches)
//! 3. Yields so the search drivers get their turns
//!
//! Commands for a session whose engine is busy producing a move wait in
//! the inbox until it is done, the way a GUI queues a premove. Commands
//! that interrupt the engine are handed over at once.
//!
//! The loop ends on `Quit`, or once the inbox is empty and no engine is
//! producing moves. Pondering and monitoring only wait for input, so they
//! are aborted at that point.

use crate::config::{Config, ConfigError, SessionConfig};
use crate::console_log;
use crate::engine::{EngineId, ReplayEngine, SharedEngine, SizedTransTables};
use crate::game::{Color, Game, Move};
use crate::kernel::lock::EngineLockTable;
use crate::kernel::scheduler::{SchedError, Scheduler};
use crate::kernel::task::Priority;
use crate::platform::{self, SharedTime};
use crate::session::{
    Activity, AutoPlay, AutoPlayReport, EventLog, MatchStats, Session, SessionEnv, SessionEvent, SessionId,
    TransitionError,
};
use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Errors from running an app
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    Config(ConfigError),
    Sched(SchedError),
    /// A session refused the command that started the run
    Rejected(TransitionError),
    /// The main task was torn down before handing the app back
    Interrupted,
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "{}", e),
            AppError::Sched(e) => write!(f, "scheduler: {}", e),
            AppError::Rejected(e) => write!(f, "refused: {}", e),
            AppError::Interrupted => write!(f, "main task did not finish"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}

impl From<SchedError> for AppError {
    fn from(e: SchedError) -> Self {
        AppError::Sched(e)
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// A user request for one session
#[derive(Debug, Clone)]
pub enum Command {
    Think,
    PlayMove(Move),
    /// Move now
    StopSearch,
    AbortSearch,
    /// Force idle without waiting
    HardAbort,
    StartMonitoring,
    ExitMonitoring,
    StartAutoPlay(AutoPlay),
    StopAutoPlay,
    TakeBack,
    NewGame,
    SetPosition(Game),
    OfferDraw,
    /// Abort and remove the session
    Close,
}

impl Command {
    /// Whether the command is handed over while the engine is producing a
    /// move
    fn interrupts(&self) -> bool {
        matches!(
            self,
            Command::StopSearch
                | Command::AbortSearch
                | Command::HardAbort
                | Command::StopAutoPlay
                | Command::ExitMonitoring
                | Command::TakeBack
                | Command::NewGame
                | Command::SetPosition(_)
                | Command::OfferDraw
                | Command::Close
        )
    }
}

enum Inbox {
    To(SessionId, Command),
    Quit,
}

pub struct App {
    config: Config,
    env: SessionEnv,
    sessions: Slab<Session>,
    inbox: VecDeque<Inbox>,
    log: EventLog,
    /// Commands a session refused
    rejected: Vec<(SessionId, TransitionError)>,
    /// Print session events as they happen
    echo: bool,
    turns: u64,
}

impl App {
    pub fn new(config: Config) -> AppResult<Self> {
        Self::with_time(config, platform::default_time_source())
    }

    /// App reading time from `time` instead of the host clock
    pub fn with_time(config: Config, time: SharedTime) -> AppResult<Self> {
        config.validate()?;
        config.apply_trace();
        let env = SessionEnv {
            locks: EngineLockTable::shared(),
            tables: SizedTransTables::shared(config.session.hash_budget_mb, config.session.hash_mb),
            time,
        };
        Ok(Self {
            config,
            env,
            sessions: Slab::new(),
            inbox: VecDeque::new(),
            log: EventLog::new(),
            rejected: Vec::new(),
            echo: false,
            turns: 0,
        })
    }

    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a session for `engine` with the app's session settings
    pub fn open_session(&mut self, engine: SharedEngine) -> SessionId {
        let config = self.config.session.clone();
        self.open_session_with(engine, config)
    }

    pub fn open_session_with(&mut self, engine: SharedEngine, config: SessionConfig) -> SessionId {
        let entry = self.sessions.vacant_entry();
        let id = SessionId(entry.key());
        entry.insert(Session::new(id, engine, self.env.clone(), config));
        console_log!("[app] opened session {}", id.0);
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id.0)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id.0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queue a command for a session
    pub fn send(&mut self, id: SessionId, command: Command) {
        self.inbox.push_back(Inbox::To(id, command));
    }

    /// Queue a stop of the whole app
    pub fn quit(&mut self) {
        self.inbox.push_back(Inbox::Quit);
    }

    pub fn events(&self) -> &EventLog {
        &self.log
    }

    pub fn rejected(&self) -> &[(SessionId, TransitionError)] {
        &self.rejected
    }

    /// Main loop turns taken so far
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Hand over every command that can be handled now. Returns false on
    /// Quit.
    async fn dispatch(&mut self, sched: &Scheduler) -> bool {
        let mut waiting = VecDeque::new();
        while let Some(item) = self.inbox.pop_front() {
            let (id, command) = match item {
                Inbox::Quit => {
                    self.inbox.clear();
                    return false;
                }
                Inbox::To(id, command) => (id, command),
            };
            let Some(session) = self.sessions.get_mut(id.0) else {
                console_log!("[app] no session {}, dropping {:?}", id.0, command);
                continue;
            };
            // Keep per-session order: once one command waits, later ones do too
            let blocked = waiting.iter().any(|item| matches!(item, Inbox::To(other, _) if *other == id));
            if blocked || (producing_moves(session) && !command.interrupts()) {
                waiting.push_back(Inbox::To(id, command));
                continue;
            }

            if let Command::Close = command {
                session.check_abort_engine(sched);
                session.flush_events(&mut self.log);
                self.sessions.remove(id.0);
                let stale = self.env.locks.borrow_mut().release_all(id);
                if stale > 0 {
                    console_log!("[app] session {} left {} engine locks behind", id.0, stale);
                }
                console_log!("[app] closed session {}", id.0);
                continue;
            }
            if let Err(e) = execute(session, sched, command).await {
                console_log!("[app] session {}: {}", id.0, e);
                self.rejected.push((id, e));
            }
        }
        self.inbox = waiting;
        true
    }

    /// Tick every session once
    fn tick(&mut self, sched: &Scheduler) {
        let before = self.log.events.len();
        for (_, session) in self.sessions.iter_mut() {
            session.on_idle_tick(sched, &mut self.log);
        }
        if self.echo {
            for (id, event) in &self.log.events[before..] {
                echo_event(*id, event);
            }
        }
    }

    /// Nothing queued and no engine producing moves
    fn is_quiescent(&self) -> bool {
        self.inbox.is_empty() && !self.sessions.iter().any(|(_, s)| producing_moves(s))
    }

    fn shutdown(&mut self, sched: &Scheduler) {
        for (_, session) in self.sessions.iter_mut() {
            session.check_abort_engine(sched);
            session.flush_events(&mut self.log);
        }
    }
}

/// Whether the session's engine is working on moves nobody waits for
fn producing_moves(session: &Session) -> bool {
    matches!(session.activity(), Activity::Thinking | Activity::AutoPlaying(_))
}

async fn execute(session: &mut Session, sched: &Scheduler, command: Command) -> Result<(), TransitionError> {
    match command {
        Command::Think => session.start_thinking(sched),
        Command::PlayMove(mv) => session.play_move(sched, mv).await,
        Command::StopSearch => session.stop_search(),
        Command::AbortSearch => {
            session.abort_current_search(sched).await;
            Ok(())
        }
        Command::HardAbort => {
            session.check_abort_engine(sched);
            Ok(())
        }
        Command::StartMonitoring => session.start_monitoring(sched),
        Command::ExitMonitoring => session.exit_monitoring(sched).await,
        Command::StartAutoPlay(job) => session.start_autoplay(sched, job),
        Command::StopAutoPlay => session.stop_autoplay(sched).await,
        Command::TakeBack => {
            session.take_back(sched);
            Ok(())
        }
        Command::NewGame => {
            session.new_game(sched);
            Ok(())
        }
        Command::SetPosition(game) => {
            session.set_position(sched, game);
            Ok(())
        }
        Command::OfferDraw => session.offer_draw(),
        // Handled by the dispatcher
        Command::Close => Ok(()),
    }
}

fn echo_event(id: SessionId, event: &SessionEvent) {
    match event {
        SessionEvent::MovePlayed(mv) => console_log!("[session {}] {}", id.0, mv),
        SessionEvent::GameOver(result) => console_log!("[session {}] game over: {}", id.0, result),
        SessionEvent::ActivityChanged { from, to } => console_log!("[session {}] {} -> {}", id.0, from, to),
        SessionEvent::AutoPlayFinished(_) => console_log!("[session {}] automated play finished", id.0),
        SessionEvent::Message(_) => {}
    }
}

/// The app's main task
pub async fn main_loop(sched: Scheduler, mut app: App) -> App {
    console_log!("[app] main loop with {} session(s)", app.session_count());
    loop {
        app.turns += 1;
        if !app.dispatch(&sched).await {
            console_log!("[app] quit");
            break;
        }
        app.tick(&sched);
        if app.is_quiescent() {
            break;
        }
        sched.switch().await;
    }
    app.shutdown(&sched);
    app
}

/// Run `app` under a fresh scheduler until its main loop ends, then hand
/// it back for inspection
pub fn run(app: App) -> AppResult<App> {
    let sched = Scheduler::begin(app.config.scheduler.capacity)?;
    let slot = Rc::new(RefCell::new(None));
    let out = slot.clone();

    sched.run(
        move |s: Scheduler, app: App| async move {
            let app = main_loop(s, app).await;
            *out.borrow_mut() = Some(app);
        },
        app,
        Priority::Interactive,
    )?;
    sched.end();

    slot.take().ok_or(AppError::Interrupted)
}

/// Play an engine match of `engine` against `opponent` as configured in
/// `config.engine_match`, `engine` starting with white
pub fn run_engine_match(config: Config, engine: SharedEngine, opponent: SharedEngine) -> AppResult<MatchStats> {
    let games = config.engine_match.games;
    let alternate = config.engine_match.alternate_colors;

    let mut app = App::new(config)?;
    app.set_echo(true);
    let id = app.open_session(engine);
    if let Some(session) = app.session_mut(id) {
        session.set_opponent(opponent);
    }
    app.send(id, Command::StartAutoPlay(AutoPlay::engine_match(games, Color::White, alternate)));

    let app = run(app)?;
    if let Some((_, e)) = app.rejected().first() {
        return Err(AppError::Rejected(*e));
    }
    match app.session(id).and_then(Session::last_report) {
        Some(AutoPlayReport::Match(stats)) => Ok(stats.clone()),
        _ => Err(AppError::Interrupted),
    }
}

/// Scholar's mate, followed by both demo engines
const DEMO_LINE: [&str; 7] = ["e2e4", "e7e5", "f1c4", "b8c6", "d1h5", "g8f6", "h5f7"];

/// Two scripted engines that replay a short mating line
pub fn demo_engines() -> (SharedEngine, SharedEngine) {
    let line: Vec<Move> = DEMO_LINE.iter().filter_map(|m| m.parse().ok()).collect();
    let scores = vec![30, -25, 40, -60, 120, -400, 29_999];
    let first = ReplayEngine::new(EngineId(1), "replay-a")
        .with_line(line.clone())
        .with_scores(scores.clone())
        .with_steps(4)
        .shared();
    let second = ReplayEngine::new(EngineId(2), "replay-b")
        .with_line(line)
        .with_scores(scores)
        .with_steps(6)
        .shared();
    (first, second)
}
