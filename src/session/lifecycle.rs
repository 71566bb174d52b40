//! Engine-task lifecycle
//!
//! Transitions of a session's activity:
//!
//! ```text
//!   Idle -> Thinking          start_thinking, or auto reply after a user move
//!   Thinking -> Idle          search done (move applied) or abort (discarded)
//!   Idle -> Backgrounding     start_pondering, right after the engine moved
//!   Backgrounding -> Thinking ponder hit: same search, no new lock or table
//!   Backgrounding -> Idle     ponder miss (then a fresh Thinking search)
//!   Idle -> Monitoring        start_monitoring; passes restart on completion
//!   Idle -> AutoPlaying       start_autoplay; searches until the run ends
//!   any -> Idle               check_abort_engine, never waits
//! ```
//!
//! A refused transition returns an error and leaves the session untouched.
//! Every search is paired with one lock (held for the whole mode), one
//! transposition table and one driver task.

use super::autoplay::{AutoPlay, AutoStep};
use super::driver::{DriverJob, DriverSignal, search_driver};
use super::state::{Activity, AutoPlayMode, TransitionError, TransitionResult};
use super::{ActiveSearch, SearchKind, Session, SessionEvent, SessionObserver};
use crate::console_log;
use crate::engine::{EngineId, SearchId, SearchRequest, SearchResult, SharedEngine, is_mate_score};
use crate::game::{Color, Game, GameResult, Move, PositionSnapshot, ResultReason};
use crate::kernel::clock::TimeControl;
use crate::kernel::msgqueue::EngineMessages;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::task::Priority;
use crate::kernel::trace::{self, TraceCategory};

impl Session {
    // ===== Transitions =====

    /// Idle -> Thinking for the side to move
    pub fn start_thinking(&mut self, sched: &Scheduler) -> TransitionResult<()> {
        self.check_enter(&Activity::Thinking)?;
        if self.game.is_over() {
            return Err(TransitionError::GameOver);
        }
        self.acquire(self.engine_id)?;

        let side = self.game.side_to_move();
        let position = self.game.snapshot();
        if let Err(e) = self.launch(sched, SearchKind::Think, position, side) {
            self.release_locks();
            return Err(e);
        }

        self.flags.user_requested_stop = false;
        self.just_moved = false;
        self.set_activity(Activity::Thinking);
        Ok(())
    }

    /// Idle -> Backgrounding: search the position after the expected reply
    /// while the user thinks
    ///
    /// Only allowed right after the engine moved, with permanent brain on, a
    /// hint available and no other session's engine running.
    pub fn start_pondering(&mut self, sched: &Scheduler) -> TransitionResult<()> {
        if !self.activity.is_idle() {
            return Err(TransitionError::AlreadyRunning {
                activity: self.activity.name(),
            });
        }
        if self.game.is_over() {
            return Err(TransitionError::GameOver);
        }
        if !self.config.permanent_brain {
            return Err(TransitionError::PermanentBrainOff);
        }
        if !self.just_moved {
            return Err(TransitionError::NotActive);
        }
        let Some(expected) = self.hint else {
            return Err(TransitionError::NoHint);
        };
        if self.env.locks.borrow().others_running(self.id) {
            return Err(TransitionError::OtherEngineRunning);
        }
        self.check_enter(&Activity::Backgrounding { expected })?;
        self.acquire(self.engine_id)?;

        // Provisionally play the reply, hand that position to the engine,
        // then take it back from the visible game
        self.game.push(expected);
        let position = self.game.snapshot();
        let side = self.game.side_to_move();
        self.game.retract();

        if let Err(e) = self.launch(sched, SearchKind::Ponder, position, side) {
            self.release_locks();
            return Err(e);
        }

        self.just_moved = false;
        self.set_activity(Activity::Backgrounding { expected });
        Ok(())
    }

    /// Play the user's move
    ///
    /// While backgrounding this decides the ponder: a hit turns the running
    /// search into the foreground search, a miss aborts it and starts a new
    /// one. While monitoring, the analysis restarts on the new position.
    /// Otherwise the engine replies when auto reply is on.
    pub async fn play_move(&mut self, sched: &Scheduler, mv: Move) -> TransitionResult<()> {
        if matches!(self.activity, Activity::Thinking | Activity::AutoPlaying(_)) {
            return Err(TransitionError::EngineThinking);
        }
        if self.game.is_over() {
            return Err(TransitionError::GameOver);
        }

        let side = self.game.side_to_move();
        let activity = self.activity;
        match activity {
            Activity::Backgrounding { expected } if expected == mv => {
                let now = self.now();
                self.clock.stop(side, now);
                self.push_move(mv);
                self.ponder_hit();
            }
            Activity::Backgrounding { .. } => {
                trace::count(|s| s.ponder_misses += 1);
                self.cancel_search(sched).await;
                self.go_idle();
                let now = self.now();
                self.clock.stop(side, now);
                self.push_move(mv);
                self.hint = None;
                self.reply(sched);
            }
            Activity::Monitoring => {
                self.cancel_search(sched).await;
                self.push_move(mv);
                self.hint = None;
                self.restart_monitor(sched);
            }
            _ => {
                let now = self.now();
                self.clock.stop(side, now);
                self.push_move(mv);
                self.hint = None;
                self.just_moved = false;
                if self.config.auto_reply {
                    self.reply(sched);
                }
            }
        }
        Ok(())
    }

    /// Idle -> Monitoring
    pub fn start_monitoring(&mut self, sched: &Scheduler) -> TransitionResult<()> {
        self.check_enter(&Activity::Monitoring)?;
        self.acquire(self.engine_id)?;

        if !self.game.is_over() {
            let side = self.game.side_to_move();
            let position = self.game.snapshot();
            if let Err(e) = self.launch(sched, SearchKind::Monitor, position, side) {
                self.release_locks();
                return Err(e);
            }
        }

        self.set_activity(Activity::Monitoring);
        Ok(())
    }

    /// Monitoring -> Idle
    pub async fn exit_monitoring(&mut self, sched: &Scheduler) -> TransitionResult<()> {
        if self.activity != Activity::Monitoring {
            return Err(TransitionError::NotActive);
        }
        self.abort_current_search(sched).await;
        Ok(())
    }

    /// Idle -> AutoPlaying
    pub fn start_autoplay(&mut self, sched: &Scheduler, mut job: AutoPlay) -> TransitionResult<()> {
        let mode = job.mode();
        self.check_enter(&Activity::AutoPlaying(mode))?;

        self.acquire(self.engine_id)?;
        let opponent = self.opponent.as_ref().map(|(_, id)| *id);
        if mode == AutoPlayMode::EngineMatch
            && let Some(opponent) = opponent
            && let Err(e) = self.acquire(opponent)
        {
            self.release_locks();
            return Err(e);
        }

        let mut game = self.game.clone();
        if !job.prepare(&mut game) {
            self.release_locks();
            return Err(if mode.plays_moves() {
                TransitionError::GameOver
            } else {
                TransitionError::NotActive
            });
        }

        let saved_game = std::mem::replace(&mut self.game, game);
        let saved_clock = self.clock.clone();
        if mode == AutoPlayMode::EngineMatch {
            self.clock.reset();
        }
        self.autoplay = Some(job);

        if let Err(e) = self.autoplay_search(sched) {
            self.autoplay = None;
            self.game = saved_game;
            self.clock = saved_clock;
            self.release_locks();
            return Err(e);
        }

        self.flags.timeout_continued = false;
        self.set_activity(Activity::AutoPlaying(mode));
        trace::record_session(TraceCategory::AutoPlay, self.id.0, "start", Some(mode.name().to_string()));
        Ok(())
    }

    /// End an automated run early, keeping its report
    pub async fn stop_autoplay(&mut self, sched: &Scheduler) -> TransitionResult<()> {
        if !self.activity.is_autoplay() {
            return Err(TransitionError::NotActive);
        }
        self.abort_current_search(sched).await;
        Ok(())
    }

    /// Abort the running search and wait for its driver to unwind
    ///
    /// The aborted search's result is never applied. Returns whether there
    /// was a search to abort.
    pub async fn abort_current_search(&mut self, sched: &Scheduler) -> bool {
        let had_search = self.search.is_some();
        self.cancel_search(sched).await;
        if self.autoplay.is_some() {
            self.finish_autoplay();
        } else {
            self.go_idle();
        }
        had_search
    }

    /// Force Idle immediately from any state
    ///
    /// Kills the driver instead of waiting for it, clears every flag, stops
    /// the clocks and releases the locks. Calling it again does nothing.
    pub fn check_abort_engine(&mut self, sched: &Scheduler) {
        self.cancel_search_now(sched);
        if let Some(auto) = self.autoplay.take() {
            self.last_report = Some(auto.report());
        }
        let now = self.now();
        self.clock.pause_all(now);
        self.release_locks();
        self.flags.clear();
        self.just_moved = false;
        self.set_activity(Activity::Idle);
    }

    /// "Move now": ask the engine to finish early. The result still counts.
    pub fn stop_search(&mut self) -> TransitionResult<()> {
        match (&self.search, self.activity) {
            (Some(search), Activity::Thinking | Activity::Monitoring | Activity::AutoPlaying(_)) => {
                search.engine.borrow_mut().stop(search.id);
                self.flags.user_requested_stop = true;
                Ok(())
            }
            _ => Err(TransitionError::NotActive),
        }
    }

    /// Take back the last move, invalidating any search on the old position
    pub fn take_back(&mut self, sched: &Scheduler) -> Option<Move> {
        let monitoring = self.invalidate_search(sched);
        let mv = self.game.take_back();
        self.position_changed(sched, monitoring);
        mv
    }

    /// Replace the game, invalidating any search on the old position
    pub fn set_position(&mut self, sched: &Scheduler, game: Game) {
        let monitoring = self.invalidate_search(sched);
        self.game = game;
        self.clock.reset();
        self.position_changed(sched, monitoring);
    }

    /// Start over from the standard position
    pub fn new_game(&mut self, sched: &Scheduler) {
        self.check_abort_engine(sched);
        self.game = Game::new();
        self.clock.reset();
        self.hint = None;
        self.last_result = None;
    }

    /// Offer the engine a draw; its next completed search decides
    pub fn offer_draw(&mut self) -> TransitionResult<()> {
        if self.game.is_over() {
            return Err(TransitionError::GameOver);
        }
        self.flags.draw_offered = true;
        Ok(())
    }

    /// Change the time control; resets the clocks
    pub fn set_time_control(&mut self, control: TimeControl) {
        self.config.time_control = control;
        self.clock.set_control(control);
    }

    // ===== Per-turn hooks =====

    /// Per-turn work for this session: check the clocks, drain engine
    /// messages, finish a completed search, continue automated play, then
    /// report to `observer`. Returns whether a search completed.
    pub fn on_idle_tick(&mut self, sched: &Scheduler, observer: &mut dyn SessionObserver) -> bool {
        let now = self.now();
        trace::with_tracer(|t| t.set_time(now));

        self.check_time(sched, now);
        let completed = self.drain_engine_messages(observer);
        if completed.is_some() {
            self.finish_search(sched);
        }
        self.flush_events(observer);
        completed.is_some()
    }

    /// Dispatch each pending engine event to `observer` exactly once and
    /// clear it. Returns the running search if it has completed; a
    /// completion left over from an aborted search is dropped.
    pub fn drain_engine_messages(&mut self, observer: &mut dyn SessionObserver) -> Option<SearchId> {
        let delivery = self.port.drain();
        if delivery.messages.is_empty() {
            return None;
        }

        let current = self.search.as_ref().map(|s| s.id);
        let completed = delivery.completed.map(SearchId).filter(|id| Some(*id) == current);

        for message in delivery.messages.iter() {
            if message == EngineMessages::SEARCH_DONE && completed.is_none() {
                continue;
            }
            observer.on_message(self.id, message);
        }
        trace::record_session(
            TraceCategory::Message,
            self.id.0,
            "drain",
            Some(delivery.messages.to_string()),
        );
        completed
    }

    // ===== Completion =====

    fn finish_search(&mut self, sched: &Scheduler) {
        let Some(search) = self.search.take() else {
            return;
        };
        let result = search.engine.borrow().result(search.id);
        let (kind, side) = (search.kind, search.side);
        self.end_search(search, true);

        let Some(result) = result else {
            // Finished without a result: the engine gave up on its own
            if self.autoplay.is_some() {
                self.finish_autoplay();
            } else {
                self.go_idle();
            }
            return;
        };
        self.last_result = Some(result.clone());

        match kind {
            SearchKind::Think => {
                self.go_idle();
                if self.apply_engine_result(&result, side) {
                    let now = self.now();
                    self.clock.start(side.opponent(), now);
                    if self.config.permanent_brain
                        && let Err(e) = self.start_pondering(sched)
                    {
                        trace::record_session(TraceCategory::Lifecycle, self.id.0, "no-ponder", Some(e.to_string()));
                    }
                }
            }
            // The user has not moved yet; a finished ponder search is moot
            SearchKind::Ponder => self.go_idle(),
            SearchKind::Monitor => self.restart_monitor(sched),
            SearchKind::Auto => self.continue_autoplay(sched, &result, side),
        }
    }

    /// Apply a completed search for `side`. Returns whether a move was
    /// played (false when the game ended instead).
    fn apply_engine_result(&mut self, result: &SearchResult, side: Color) -> bool {
        let opponent = side.opponent();
        let Some(mv) = result.best_move else {
            let outcome = if result.score < 0 && is_mate_score(result.score) {
                GameResult::Win {
                    winner: opponent,
                    reason: ResultReason::Checkmate,
                }
            } else {
                GameResult::Draw {
                    reason: ResultReason::Stalemate,
                }
            };
            self.end_game(outcome);
            return false;
        };

        let threshold = self.config.resign_threshold;
        if threshold > 0 && result.score <= -threshold {
            self.flags.has_resigned = true;
            self.end_game(GameResult::Win {
                winner: opponent,
                reason: ResultReason::Resignation,
            });
            return false;
        }

        if self.flags.draw_offered {
            self.flags.draw_offered = false;
            if result.score <= self.config.draw_threshold {
                self.end_game(GameResult::Draw {
                    reason: ResultReason::DrawAgreed,
                });
                return false;
            }
        }

        if result.score > 0 && is_mate_score(result.score) {
            self.flags.has_announced_mate = true;
        }

        self.push_move(mv);
        self.hint = result.hint();
        self.just_moved = true;
        true
    }

    fn continue_autoplay(&mut self, sched: &Scheduler, result: &SearchResult, side: Color) {
        let Some(mut auto) = self.autoplay.take() else {
            self.go_idle();
            return;
        };

        let step = if auto.mode().plays_moves() {
            if self.apply_engine_result(result, side) {
                AutoStep::Continue
            } else {
                match self.game.result() {
                    Some(outcome) => {
                        let step = auto.game_finished(&mut self.game, outcome);
                        trace::record_session(
                            TraceCategory::AutoPlay,
                            self.id.0,
                            "game-over",
                            Some(outcome.to_string()),
                        );
                        if step == AutoStep::Continue {
                            self.clock.reset();
                            self.flags.has_resigned = false;
                            self.flags.has_announced_mate = false;
                        }
                        step
                    }
                    None => AutoStep::Finished,
                }
            }
        } else {
            auto.analysis_done(&mut self.game, result)
        };
        self.autoplay = Some(auto);

        match step {
            AutoStep::Continue => {
                if let Err(e) = self.autoplay_search(sched) {
                    console_log!("[session {}] automated play stopped: {}", self.id.0, e);
                    self.finish_autoplay();
                }
            }
            AutoStep::Finished => self.finish_autoplay(),
        }
    }

    fn autoplay_search(&mut self, sched: &Scheduler) -> TransitionResult<()> {
        let side = self.game.side_to_move();
        let position = self.game.snapshot();
        self.launch(sched, SearchKind::Auto, position, side)
    }

    fn finish_autoplay(&mut self) {
        if let Some(auto) = self.autoplay.take() {
            let report = auto.report();
            trace::record_session(TraceCategory::AutoPlay, self.id.0, "finish", Some(auto.mode().name().to_string()));
            self.outbox.push(SessionEvent::AutoPlayFinished(report.clone()));
            self.last_report = Some(report);
        }
        let now = self.now();
        self.clock.pause_all(now);
        self.go_idle();
    }

    fn restart_monitor(&mut self, sched: &Scheduler) {
        if self.activity != Activity::Monitoring || self.game.is_over() || self.search.is_some() {
            return;
        }
        let side = self.game.side_to_move();
        let position = self.game.snapshot();
        if let Err(e) = self.launch(sched, SearchKind::Monitor, position, side) {
            console_log!("[session {}] monitoring stopped: {}", self.id.0, e);
            self.go_idle();
        }
    }

    // ===== Clocks =====

    fn check_time(&mut self, sched: &Scheduler, now: f64) {
        if self.game.is_over() {
            return;
        }
        let Some(side) = self.clock.running_side() else {
            return;
        };
        if !self.clock.flag_fallen(side, now) {
            return;
        }

        let keep_playing = self.config.timeout_continue
            || self.activity.autoplay_mode().is_some_and(AutoPlayMode::plays_moves);
        if keep_playing {
            self.clock.reset_side(side, now);
            self.flags.timeout_continued = true;
            trace::record_session(TraceCategory::Clock, self.id.0, "timeout-continue", Some(side.to_string()));
            return;
        }

        trace::count(|s| s.time_forfeits += 1);
        console_log!("[session {}] {} lost on time", self.id.0, side);
        self.check_abort_engine(sched);
        self.end_game(GameResult::Win {
            winner: side.opponent(),
            reason: ResultReason::TimeForfeit,
        });
    }

    // ===== Plumbing =====

    /// Allocate a table, spawn a driver and start the engine
    ///
    /// Leaves nothing behind when it fails.
    fn launch(
        &mut self,
        sched: &Scheduler,
        kind: SearchKind,
        position: PositionSnapshot,
        side: Color,
    ) -> TransitionResult<()> {
        let (engine, engine_id) = self.engine_for(side);
        self.env.tables.borrow_mut().allocate(engine_id)?;

        let id = SearchId(self.next_serial);
        let signal = DriverSignal::new();
        let job = DriverJob::new(engine.clone(), id, self.port.clone(), signal.clone());
        let priority = match kind {
            SearchKind::Ponder => Priority::Background,
            _ => Priority::Normal,
        };
        let task = match sched.create(search_driver, job, priority) {
            Ok(task) => task,
            Err(e) => {
                self.env.tables.borrow_mut().deallocate(engine_id);
                return Err(e.into());
            }
        };
        self.next_serial += 1;

        let timed = match kind {
            SearchKind::Think => true,
            SearchKind::Auto => self.autoplay.as_ref().is_some_and(|a| a.mode().plays_moves()),
            SearchKind::Ponder | SearchKind::Monitor => false,
        };
        let now = self.now();
        let move_time_ms = if timed { self.clock.move_budget(side, now) } else { None };
        engine.borrow_mut().start(SearchRequest {
            id,
            position,
            side,
            ponder: kind == SearchKind::Ponder,
            move_time_ms,
        });
        if timed {
            self.clock.start(side, now);
        }

        trace::count(|s| s.searches_started += 1);
        trace::record_session(
            TraceCategory::Lifecycle,
            self.id.0,
            "search",
            Some(format!("{} {:?} on {} for {}", id, kind, engine_id, side)),
        );
        self.search = Some(ActiveSearch {
            id,
            kind,
            task,
            signal,
            engine,
            engine_id,
            side,
            timed,
            started_at: now,
        });
        Ok(())
    }

    /// Engine that searches for `side`: the opponent engine plays the
    /// other colour in a match, the session's engine does everything else
    fn engine_for(&self, side: Color) -> (SharedEngine, EngineId) {
        if let (Some(auto), Some((opponent, opponent_id))) = (&self.autoplay, &self.opponent)
            && auto.engine_color().is_some_and(|own| own != side)
        {
            return (opponent.clone(), *opponent_id);
        }
        (self.engine.clone(), self.engine_id)
    }

    /// Bookkeeping at the end of a search: clock, counters, table
    fn end_search(&mut self, search: ActiveSearch, completed: bool) {
        let now = self.now();
        if search.timed {
            if completed {
                self.clock.stop(search.side, now);
            } else {
                self.clock.pause(search.side, now);
            }
        }
        if completed {
            trace::count(|s| {
                s.searches_completed += 1;
                s.search_time.record(now - search.started_at);
            });
        } else {
            trace::count(|s| s.searches_aborted += 1);
            self.port.discard_done();
        }
        self.env.tables.borrow_mut().deallocate(search.engine_id);
    }

    /// Abort the running search and wait until its driver has unwound
    ///
    /// The driver aborts the engine on its next turn.
    async fn cancel_search(&mut self, sched: &Scheduler) {
        let Some(search) = self.search.take() else {
            return;
        };
        search.signal.request_abort();

        while !search.signal.has_exited() && sched.is_running() {
            sched.switch().await;
        }
        if !search.signal.has_exited() {
            search.engine.borrow_mut().abort(search.id);
            sched.kill(search.task);
        }
        self.end_search(search, false);
    }

    /// Abort the running search without waiting: its driver is killed
    fn cancel_search_now(&mut self, sched: &Scheduler) {
        let Some(search) = self.search.take() else {
            return;
        };
        search.signal.request_abort();
        search.engine.borrow_mut().abort(search.id);
        if !search.signal.has_exited() {
            sched.kill(search.task);
        }
        self.end_search(search, false);
    }

    /// Drop any search on the current position before it changes. Returns
    /// whether monitoring should resume afterwards.
    fn invalidate_search(&mut self, sched: &Scheduler) -> bool {
        let monitoring = self.activity == Activity::Monitoring;
        if monitoring {
            self.cancel_search_now(sched);
        } else if !self.activity.is_idle() {
            self.check_abort_engine(sched);
        }
        monitoring
    }

    fn position_changed(&mut self, sched: &Scheduler, monitoring: bool) {
        self.hint = None;
        self.just_moved = false;
        let now = self.now();
        self.clock.pause_all(now);
        if monitoring {
            self.restart_monitor(sched);
        }
    }

    /// Start the engine's reply to a user move
    fn reply(&mut self, sched: &Scheduler) {
        if let Err(e) = self.start_thinking(sched) {
            console_log!("[session {}] engine cannot reply: {}", self.id.0, e);
        }
    }

    /// Backgrounding -> Thinking without touching lock or table
    fn ponder_hit(&mut self) {
        let now = self.now();
        let Some(search) = self.search.as_mut() else {
            return;
        };
        search.engine.borrow_mut().ponder_hit(search.id);
        search.kind = SearchKind::Think;
        search.timed = true;
        search.started_at = now;
        let side = search.side;

        self.clock.start(side, now);
        trace::count(|s| s.ponder_hits += 1);
        self.set_activity(Activity::Thinking);
    }

    fn push_move(&mut self, mv: Move) {
        self.game.push(mv);
        self.outbox.push(SessionEvent::MovePlayed(mv));
    }

    fn end_game(&mut self, result: GameResult) {
        self.game.set_result(result);
        let now = self.now();
        self.clock.pause_all(now);
        trace::record_session(TraceCategory::Lifecycle, self.id.0, "game-over", Some(result.to_string()));
        self.outbox.push(SessionEvent::GameOver(result));
    }

    fn check_enter(&self, next: &Activity) -> TransitionResult<()> {
        if self.activity.is_idle() && self.activity.can_enter(next) {
            Ok(())
        } else {
            Err(TransitionError::AlreadyRunning {
                activity: self.activity.name(),
            })
        }
    }

    fn set_activity(&mut self, next: Activity) {
        let from = self.activity;
        if from == next {
            return;
        }
        debug_assert!(from.can_enter(&next), "illegal transition {} -> {}", from, next);
        self.activity = next;
        trace::record_session(
            TraceCategory::Lifecycle,
            self.id.0,
            next.name(),
            Some(format!("{} -> {}", from, next)),
        );
        self.outbox.push(SessionEvent::ActivityChanged { from, to: next });
    }

    fn go_idle(&mut self) {
        self.release_locks();
        self.flags.user_requested_stop = false;
        self.set_activity(Activity::Idle);
    }

    fn acquire(&mut self, engine: EngineId) -> TransitionResult<()> {
        if self.held.contains(&engine) {
            return Ok(());
        }
        let acquired = self.env.locks.borrow_mut().acquire(engine, self.id);
        match acquired {
            Ok(_) => {
                self.held.push(engine);
                Ok(())
            }
            Err(e) => {
                trace::count(|s| s.lock_denials += 1);
                console_log!("[session {}] {}: {}", self.id.0, engine, e);
                Err(e.into())
            }
        }
    }

    fn release_locks(&mut self) {
        let mut locks = self.env.locks.borrow_mut();
        for engine in self.held.drain(..) {
            // Released by someone else already (app closing the session)
            let _ = locks.release(engine, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::engine::{MATE_SCORE, ReplayEngine, SizedTransTables};
    use crate::kernel::lock::{EngineLockTable, SessionId, SharedLocks};
    use crate::platform::ManualTimeSource;
    use crate::session::autoplay::{AutoPlayReport, EpdRecord};
    use crate::session::{EventLog, SessionEnv};
    use std::cell::RefCell;
    use std::future::Future;
    use std::rc::Rc;

    type Engine = Rc<RefCell<ReplayEngine>>;
    type Tables = Rc<RefCell<SizedTransTables>>;

    fn mv(s: &str) -> Move {
        s.parse().unwrap()
    }

    fn opening() -> Vec<Move> {
        ["e2e4", "e7e5", "g1f3", "b8c6", "f1b5", "a7a6"].iter().map(|m| mv(m)).collect()
    }

    struct Fixture {
        engine: Engine,
        tables: Tables,
        locks: SharedLocks,
        time: ManualTimeSource,
    }

    impl Fixture {
        fn new(engine: ReplayEngine) -> Self {
            Self {
                engine: engine.shared(),
                tables: SizedTransTables::shared(128, 16),
                locks: EngineLockTable::shared(),
                time: ManualTimeSource::new(0.0),
            }
        }

        fn env(&self) -> SessionEnv {
            SessionEnv {
                locks: self.locks.clone(),
                tables: self.tables.clone(),
                time: Rc::new(self.time.clone()),
            }
        }

        fn session(&self, id: usize, config: SessionConfig) -> Session {
            Session::new(SessionId(id), self.engine.clone(), self.env(), config)
        }
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            permanent_brain: false,
            auto_reply: false,
            time_control: TimeControl::Infinite,
            ..Default::default()
        }
    }

    fn replay() -> ReplayEngine {
        ReplayEngine::new(EngineId(1), "replay").with_line(opening())
    }

    /// Run `main` as the main task of a fresh scheduler
    fn run_main<F, Fut>(capacity: usize, main: F)
    where
        F: FnOnce(Scheduler) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let sched = Scheduler::begin(capacity).unwrap();
        sched
            .run(move |s: Scheduler, ()| main(s), (), Priority::Interactive)
            .unwrap();
    }

    /// Tick the session once per turn until `done` holds
    async fn tick_until(
        s: &Scheduler,
        session: &mut Session,
        log: &mut EventLog,
        done: impl Fn(&Session) -> bool,
    ) -> bool {
        for _ in 0..200 {
            session.on_idle_tick(s, log);
            if done(session) {
                return true;
            }
            s.switch().await;
        }
        false
    }

    #[test]
    fn test_think_plays_move_and_releases() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_thinking(&s).unwrap();
            assert_eq!(session.activity(), Activity::Thinking);
            assert_eq!(fx.locks.borrow().holder(EngineId(1)), Some(SessionId(1)));
            assert_eq!(fx.tables.borrow().live_tables(), 1);
            let task = session.search_task().unwrap();
            assert!(s.is_active(task));

            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);

            assert_eq!(session.game().played(), &[mv("e2e4")]);
            assert_eq!(session.hint(), Some(mv("e7e5")));
            assert!(!session.holds_lock());
            assert_eq!(fx.locks.borrow().holder(EngineId(1)), None);
            assert_eq!(fx.tables.borrow().live_tables(), 0);
            assert!(!s.is_active(task));
            assert!(log.events.iter().any(|(_, e)| *e == SessionEvent::MovePlayed(mv("e2e4"))));
            assert!(log
                .events
                .iter()
                .any(|(_, e)| *e == SessionEvent::Message(EngineMessages::SEARCH_DONE)));
        });
    }

    #[test]
    fn test_refused_thinking_changes_nothing() {
        let fx = Fixture::new(replay().with_steps(50));
        let mut first = fx.session(1, quiet_config());
        let mut second = fx.session(2, quiet_config());

        run_main(4, move |s| async move {
            first.start_thinking(&s).unwrap();

            // Already thinking
            let err = first.start_thinking(&s).unwrap_err();
            assert_eq!(err, TransitionError::AlreadyRunning { activity: "thinking" });
            assert_eq!(first.activity(), Activity::Thinking);
            assert_eq!(s.active_count(), 2);

            // Same engine identity, held by the first session
            let err = second.start_thinking(&s).unwrap_err();
            assert!(matches!(err, TransitionError::LockDenied(_)));
            assert_eq!(second.activity(), Activity::Idle);
            assert!(!second.holds_lock());
            assert_eq!(fx.locks.borrow().holder(EngineId(1)), Some(SessionId(1)));
            assert_eq!(fx.tables.borrow().allocations(), 1);

            first.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_thinking_refused_when_game_over() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, quiet_config());
        run_main(2, move |s| async move {
            let mut game = Game::new();
            game.set_result(GameResult::Draw {
                reason: ResultReason::DrawAgreed,
            });
            session.set_position(&s, game);
            assert_eq!(session.start_thinking(&s), Err(TransitionError::GameOver));
            assert!(!session.holds_lock());
        });
    }

    #[test]
    fn test_no_task_slot_rolls_back() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, quiet_config());
        // Only the main task fits
        run_main(1, move |s| async move {
            let err = session.start_thinking(&s).unwrap_err();
            assert!(matches!(err, TransitionError::NoTaskSlot(_)));
            assert_eq!(session.activity(), Activity::Idle);
            assert!(!session.holds_lock());
            assert_eq!(fx.tables.borrow().live_tables(), 0);
            assert_eq!(fx.locks.borrow().held_count(), 0);
        });
    }

    #[test]
    fn test_table_failure_rolls_back() {
        let mut fx = Fixture::new(replay());
        fx.tables = SizedTransTables::shared(8, 16);
        let mut session = fx.session(1, quiet_config());
        run_main(2, move |s| async move {
            let err = session.start_thinking(&s).unwrap_err();
            assert!(matches!(err, TransitionError::TableAllocation(_)));
            assert!(!session.holds_lock());
            assert_eq!(s.active_count(), 1);
        });
    }

    /// Engine plays white, then ponders on the expected black reply
    async fn reach_backgrounding(s: &Scheduler, session: &mut Session, log: &mut EventLog) {
        session.start_thinking(s).unwrap();
        let reached = tick_until(s, session, log, |s| {
            matches!(s.activity(), Activity::Backgrounding { .. })
        })
        .await;
        assert!(reached);
    }

    fn pondering_config() -> SessionConfig {
        SessionConfig {
            permanent_brain: true,
            ..quiet_config()
        }
    }

    #[test]
    fn test_ponder_starts_after_engine_move() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, pondering_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            reach_backgrounding(&s, &mut session, &mut log).await;

            assert_eq!(
                session.activity(),
                Activity::Backgrounding { expected: mv("e7e5") }
            );
            // The hypothetical move is not in the visible game
            assert_eq!(session.game().played(), &[mv("e2e4")]);
            let request = fx.engine.borrow().last_request().cloned().unwrap();
            assert!(request.ponder);
            assert_eq!(request.position.moves, vec![mv("e2e4"), mv("e7e5")]);
            assert_eq!(request.side, Color::White);
            assert!(session.holds_lock());

            session.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_ponder_hit_keeps_search() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, pondering_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            reach_backgrounding(&s, &mut session, &mut log).await;

            let search = session.search_id();
            let allocations = fx.tables.borrow().allocations();
            let deallocations = fx.tables.borrow().deallocations();

            session.play_move(&s, mv("e7e5")).await.unwrap();

            assert_eq!(session.activity(), Activity::Thinking);
            assert_eq!(session.search_id(), search);
            assert_eq!(fx.tables.borrow().allocations(), allocations);
            assert_eq!(fx.tables.borrow().deallocations(), deallocations);
            assert_eq!(fx.engine.borrow().calls().ponder_hits, 1);
            assert_eq!(fx.engine.borrow().calls().aborts, 0);
            assert!(session.holds_lock());

            // The reclassified search completes normally
            let done = tick_until(&s, &mut session, &mut log, |s| s.game().ply() == 3).await;
            assert!(done);
            assert_eq!(session.game().last_move(), Some(mv("g1f3")));

            session.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_ponder_miss_restarts_search() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, pondering_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            reach_backgrounding(&s, &mut session, &mut log).await;

            let search = session.search_id();
            let allocations = fx.tables.borrow().allocations();
            let deallocations = fx.tables.borrow().deallocations();

            session.play_move(&s, mv("c7c5")).await.unwrap();

            assert_eq!(session.activity(), Activity::Thinking);
            assert_ne!(session.search_id(), search);
            assert_eq!(fx.tables.borrow().deallocations(), deallocations + 1);
            assert_eq!(fx.tables.borrow().allocations(), allocations + 1);
            assert_eq!(fx.engine.borrow().calls().aborts, 1);
            assert_eq!(session.game().played(), &[mv("e2e4"), mv("c7c5")]);
            let request = fx.engine.borrow().last_request().cloned().unwrap();
            assert!(!request.ponder);
            assert_eq!(request.position.moves, vec![mv("e2e4"), mv("c7c5")]);

            session.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_ponder_preconditions() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();

            // Nothing has been played yet
            session.config_mut().permanent_brain = true;
            assert_eq!(session.start_pondering(&s), Err(TransitionError::NotActive));

            session.config_mut().permanent_brain = false;
            session.start_thinking(&s).unwrap();
            tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await;
            assert_eq!(session.start_pondering(&s), Err(TransitionError::PermanentBrainOff));

            session.config_mut().permanent_brain = true;
            // Another session's engine is running (its own identity)
            fx.locks.borrow_mut().acquire(EngineId(9), SessionId(2)).unwrap();
            assert_eq!(session.start_pondering(&s), Err(TransitionError::OtherEngineRunning));
            fx.locks.borrow_mut().release(EngineId(9), SessionId(2)).unwrap();

            assert!(session.start_pondering(&s).is_ok());
            session.check_abort_engine(&s);
            assert_eq!(session.start_pondering(&s), Err(TransitionError::NotActive));
        });
    }

    #[test]
    fn test_abort_discards_result() {
        let fx = Fixture::new(replay().with_steps(5));
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_thinking(&s).unwrap();
            s.switch().await;
            s.switch().await;
            let task = session.search_task().unwrap();

            assert!(session.abort_current_search(&s).await);
            assert_eq!(session.activity(), Activity::Idle);
            assert!(!s.is_active(task));
            assert!(!session.holds_lock());
            assert_eq!(fx.tables.borrow().live_tables(), 0);

            for _ in 0..10 {
                session.on_idle_tick(&s, &mut log);
                s.switch().await;
            }
            assert_eq!(session.game().ply(), 0);
            assert!(!log
                .events
                .iter()
                .any(|(_, e)| *e == SessionEvent::Message(EngineMessages::SEARCH_DONE)));
            assert!(!session.abort_current_search(&s).await);
        });
    }

    #[test]
    fn test_check_abort_from_every_state() {
        let fx = Fixture::new(replay().with_steps(50));
        let mut session = fx.session(1, pondering_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            let idle_and_free = |session: &Session, s: &Scheduler| {
                session.activity().is_idle()
                    && !session.holds_lock()
                    && !session.is_searching()
                    && !session.flags().any()
                    && s.active_count() == 1
            };

            // Idle
            session.check_abort_engine(&s);
            assert!(idle_and_free(&session, &s));

            // Thinking
            session.start_thinking(&s).unwrap();
            session.stop_search().unwrap();
            assert!(session.flags().user_requested_stop);
            session.check_abort_engine(&s);
            assert!(idle_and_free(&session, &s));
            session.check_abort_engine(&s);
            assert!(idle_and_free(&session, &s));

            // Monitoring
            session.start_monitoring(&s).unwrap();
            session.check_abort_engine(&s);
            assert!(idle_and_free(&session, &s));

            // AutoPlaying
            session.start_autoplay(&s, AutoPlay::plain()).unwrap();
            session.check_abort_engine(&s);
            assert!(idle_and_free(&session, &s));
            assert!(session.last_report().is_some());

            // Backgrounding
            session.start_thinking(&s).unwrap();
            for _ in 0..80 {
                session.on_idle_tick(&s, &mut log);
                s.switch().await;
            }
            assert!(matches!(session.activity(), Activity::Backgrounding { .. }));
            session.check_abort_engine(&s);
            assert!(idle_and_free(&session, &s));

            assert_eq!(fx.locks.borrow().held_count(), 0);
            assert_eq!(fx.tables.borrow().live_tables(), 0);
        });
    }

    #[test]
    fn test_monitoring_restarts_passes() {
        let fx = Fixture::new(replay());
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_monitoring(&s).unwrap();
            let first = session.search_id().unwrap();

            assert!(tick_until(&s, &mut session, &mut log, |s| s.last_result().is_some()).await);
            assert_eq!(session.activity(), Activity::Monitoring);
            let second = session.search_id().unwrap();
            assert!(second > first);
            // Analysis never plays moves
            assert_eq!(session.game().ply(), 0);

            // The user moves: the pass restarts on the new position
            session.play_move(&s, mv("d2d4")).await.unwrap();
            assert_eq!(session.activity(), Activity::Monitoring);
            let request = fx.engine.borrow().last_request().cloned().unwrap();
            assert_eq!(request.position.moves, vec![mv("d2d4")]);

            // So does a take back
            assert_eq!(session.take_back(&s), Some(mv("d2d4")));
            let request = fx.engine.borrow().last_request().cloned().unwrap();
            assert!(request.position.moves.is_empty());
            assert!(session.holds_lock());

            session.exit_monitoring(&s).await.unwrap();
            assert_eq!(session.activity(), Activity::Idle);
            assert!(!session.holds_lock());
            assert_eq!(session.exit_monitoring(&s).await, Err(TransitionError::NotActive));
        });
    }

    #[test]
    fn test_user_move_rejected_while_thinking() {
        let fx = Fixture::new(replay().with_steps(50));
        let mut session = fx.session(1, quiet_config());
        run_main(4, move |s| async move {
            session.start_thinking(&s).unwrap();
            let err = session.play_move(&s, mv("e2e4")).await.unwrap_err();
            assert_eq!(err, TransitionError::EngineThinking);
            assert_eq!(session.game().ply(), 0);
            session.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_auto_reply_after_user_move() {
        let fx = Fixture::new(replay());
        let config = SessionConfig {
            auto_reply: true,
            ..quiet_config()
        };
        let mut session = fx.session(1, config);
        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.play_move(&s, mv("e2e4")).await.unwrap();
            assert_eq!(session.activity(), Activity::Thinking);
            assert!(tick_until(&s, &mut session, &mut log, |s| s.game().ply() == 2).await);
            assert_eq!(session.game().last_move(), Some(mv("e7e5")));
        });
    }

    #[test]
    fn test_time_forfeit() {
        let fx = Fixture::new(replay().with_steps(1000));
        let config = SessionConfig {
            time_control: TimeControl::FixedPerMove { ms: 100.0 },
            ..quiet_config()
        };
        let mut session = fx.session(1, config);
        let time = fx.time.clone();

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_thinking(&s).unwrap();
            session.on_idle_tick(&s, &mut log);
            assert_eq!(session.activity(), Activity::Thinking);

            time.advance(150.0);
            session.on_idle_tick(&s, &mut log);

            assert_eq!(
                session.game().result(),
                Some(GameResult::Win {
                    winner: Color::Black,
                    reason: ResultReason::TimeForfeit
                })
            );
            assert_eq!(session.activity(), Activity::Idle);
            assert!(!session.holds_lock());
            assert_eq!(s.active_count(), 1);
        });
    }

    #[test]
    fn test_timeout_continue_resets_clock() {
        let fx = Fixture::new(replay().with_steps(1000));
        let config = SessionConfig {
            time_control: TimeControl::FixedPerMove { ms: 100.0 },
            timeout_continue: true,
            ..quiet_config()
        };
        let mut session = fx.session(1, config);
        let time = fx.time.clone();

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_thinking(&s).unwrap();
            time.advance(150.0);
            session.on_idle_tick(&s, &mut log);

            assert!(session.flags().timeout_continued);
            assert!(!session.game().is_over());
            assert_eq!(session.activity(), Activity::Thinking);
            assert_eq!(session.clock().remaining(Color::White, 150.0), 100.0);
            session.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_resignation_intercepts_move() {
        let fx = Fixture::new(replay().with_scores(vec![-1200]));
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_thinking(&s).unwrap();
            assert!(tick_until(&s, &mut session, &mut log, |s| s.game().is_over()).await);

            assert!(session.flags().has_resigned);
            assert_eq!(session.game().ply(), 0);
            assert_eq!(
                session.game().result(),
                Some(GameResult::Win {
                    winner: Color::Black,
                    reason: ResultReason::Resignation
                })
            );
            assert!(log.events.iter().any(|(_, e)| matches!(e, SessionEvent::GameOver(_))));
        });
    }

    #[test]
    fn test_draw_offer() {
        let fx = Fixture::new(replay().with_scores(vec![0, 0, 80]));
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();

            // Declined at +80: the move is played and the offer lapses
            session.set_position(&s, Game::from_moves(crate::game::START_FEN, opening()[..2].to_vec()));
            session.offer_draw().unwrap();
            session.start_thinking(&s).unwrap();
            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);
            assert_eq!(session.game().ply(), 3);
            assert!(!session.flags().draw_offered);

            // Accepted at 0
            session.set_position(&s, Game::new());
            session.offer_draw().unwrap();
            session.start_thinking(&s).unwrap();
            assert!(tick_until(&s, &mut session, &mut log, |s| s.game().is_over()).await);
            assert_eq!(
                session.game().result(),
                Some(GameResult::Draw {
                    reason: ResultReason::DrawAgreed
                })
            );
            assert_eq!(session.offer_draw(), Err(TransitionError::GameOver));
        });
    }

    #[test]
    fn test_mate_announcement() {
        let fx = Fixture::new(replay().with_scores(vec![MATE_SCORE - 3]));
        let mut session = fx.session(1, quiet_config());
        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_thinking(&s).unwrap();
            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);
            assert!(session.flags().has_announced_mate);
            assert_eq!(session.game().ply(), 1);
        });
    }

    #[test]
    fn test_stop_search_applies_result() {
        let fx = Fixture::new(replay().with_steps(1000));
        let mut session = fx.session(1, quiet_config());
        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            assert_eq!(session.stop_search(), Err(TransitionError::NotActive));
            session.start_thinking(&s).unwrap();
            session.stop_search().unwrap();
            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);
            assert_eq!(session.game().played(), &[mv("e2e4")]);
            assert!(!session.flags().user_requested_stop);
        });
    }

    #[test]
    fn test_take_back_hard_aborts_search() {
        let fx = Fixture::new(replay().with_steps(1000));
        let mut session = fx.session(1, quiet_config());
        run_main(4, move |s| async move {
            session.set_position(&s, Game::from_moves(crate::game::START_FEN, vec![mv("e2e4")]));
            session.start_thinking(&s).unwrap();
            assert_eq!(session.take_back(&s), Some(mv("e2e4")));
            assert_eq!(session.activity(), Activity::Idle);
            assert!(!session.holds_lock());
            assert_eq!(s.active_count(), 1);
        });
    }

    #[test]
    fn test_autoplay_plain_until_mate() {
        // Three moves, then black has none and is mated
        let fx = Fixture::new(replay().with_line(opening()[..3].to_vec()).with_steps(2));
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_autoplay(&s, AutoPlay::plain()).unwrap();
            assert_eq!(session.activity(), Activity::AutoPlaying(AutoPlayMode::Plain));
            assert!(session.holds_lock());

            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);
            assert_eq!(session.game().ply(), 3);
            assert_eq!(
                session.game().result(),
                Some(GameResult::Win {
                    winner: Color::White,
                    reason: ResultReason::Checkmate
                })
            );
            assert_eq!(session.last_report(), Some(&AutoPlayReport::Played { games: 1 }));
            assert!(!session.holds_lock());
            assert!(log
                .events
                .iter()
                .any(|(_, e)| matches!(e, SessionEvent::AutoPlayFinished(_))));
        });
    }

    #[test]
    fn test_autoplay_refused_when_busy() {
        let fx = Fixture::new(replay().with_steps(50));
        let mut session = fx.session(1, quiet_config());
        run_main(4, move |s| async move {
            session.start_monitoring(&s).unwrap();
            let err = session.start_autoplay(&s, AutoPlay::plain()).unwrap_err();
            assert_eq!(err, TransitionError::AlreadyRunning { activity: "monitoring" });
            assert_eq!(session.activity(), Activity::Monitoring);
            assert!(session.autoplay().is_none());
            session.check_abort_engine(&s);

            assert_eq!(
                session.start_autoplay(&s, AutoPlay::analyze_collection(Vec::new())),
                Err(TransitionError::NotActive)
            );
            assert!(!session.holds_lock());
        });
    }

    #[test]
    fn test_engine_match_between_two_engines() {
        let fx = Fixture::new(replay().with_line(opening()[..3].to_vec()).with_steps(1));
        let opponent = ReplayEngine::new(EngineId(2), "opponent")
            .with_line(opening()[..3].to_vec())
            .with_steps(1)
            .shared();
        let mut session = fx.session(1, quiet_config());
        session.set_opponent(opponent.clone());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session
                .start_autoplay(&s, AutoPlay::engine_match(2, Color::White, true))
                .unwrap();
            assert_eq!(fx.locks.borrow().held_count(), 2);

            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);

            let Some(AutoPlayReport::Match(stats)) = session.last_report().cloned() else {
                panic!("no match report");
            };
            // White mates in both games; the session engine is white only in the first
            assert_eq!((stats.wins, stats.draws, stats.losses), (1, 0, 1));
            assert_eq!(stats.games[1].engine_color, Color::Black);
            // Both engines searched
            assert!(opponent.borrow().calls().starts >= 2);
            assert!(fx.engine.borrow().calls().starts >= 2);
            assert_eq!(fx.locks.borrow().held_count(), 0);
            assert_eq!(fx.tables.borrow().live_tables(), 0);
        });
    }

    #[test]
    fn test_engine_match_lock_denied_for_opponent() {
        let fx = Fixture::new(replay());
        let opponent = ReplayEngine::new(EngineId(2), "opponent").shared();
        let mut session = fx.session(1, quiet_config());
        session.set_opponent(opponent);
        fx.locks.borrow_mut().acquire(EngineId(2), SessionId(7)).unwrap();

        run_main(4, move |s| async move {
            let err = session
                .start_autoplay(&s, AutoPlay::engine_match(2, Color::White, true))
                .unwrap_err();
            assert!(matches!(err, TransitionError::LockDenied(_)));
            assert!(!session.holds_lock());
            assert_eq!(fx.locks.borrow().holder(EngineId(1)), None);
        });
    }

    #[test]
    fn test_analyze_game_annotates_each_position() {
        let fx = Fixture::new(replay().with_steps(1));
        let mut session = fx.session(1, quiet_config());

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.set_position(&s, Game::from_moves(crate::game::START_FEN, opening()[..2].to_vec()));
            session.start_autoplay(&s, AutoPlay::analyze_game()).unwrap();
            assert_eq!(session.game().ply(), 0);

            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);

            match session.last_report() {
                Some(AutoPlayReport::Analysis { games }) => {
                    let best: Vec<_> = games[0].iter().map(|a| a.best_move).collect();
                    assert_eq!(best, vec![Some(mv("e2e4")), Some(mv("e7e5")), Some(mv("g1f3"))]);
                }
                other => panic!("unexpected report {:?}", other),
            }
            // The game itself is unchanged and positioned at its end
            assert_eq!(session.game().played(), &opening()[..2]);
            assert!(!session.game().is_over());
        });
    }

    #[test]
    fn test_analyze_game_keeps_recorded_result() {
        let fx = Fixture::new(replay().with_steps(1));
        let mut session = fx.session(1, quiet_config());
        let agreed = GameResult::Draw {
            reason: ResultReason::DrawAgreed,
        };

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            let mut game = Game::from_moves(crate::game::START_FEN, opening()[..2].to_vec());
            game.set_result(agreed);
            session.set_position(&s, game);
            session.start_autoplay(&s, AutoPlay::analyze_game()).unwrap();

            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);

            assert!(matches!(session.last_report(), Some(AutoPlayReport::Analysis { .. })));
            assert_eq!(session.game().played(), &opening()[..2]);
            assert_eq!(session.game().result(), Some(agreed));
        });
    }

    #[test]
    fn test_autoplay_flag_fall_keeps_playing() {
        let fx = Fixture::new(replay().with_steps(1000));
        let config = SessionConfig {
            time_control: TimeControl::FixedPerMove { ms: 100.0 },
            ..quiet_config()
        };
        let mut session = fx.session(1, config);
        let time = fx.time.clone();

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            session.start_autoplay(&s, AutoPlay::demo()).unwrap();
            session.on_idle_tick(&s, &mut log);
            assert!(!session.flags().timeout_continued);

            time.advance(150.0);
            session.on_idle_tick(&s, &mut log);

            assert!(session.flags().timeout_continued);
            assert!(!session.game().is_over());
            assert_eq!(session.activity(), Activity::AutoPlaying(AutoPlayMode::DemoPlay));
            assert!(session.holds_lock());
            session.check_abort_engine(&s);
        });
    }

    #[test]
    fn test_analyze_epd() {
        let fx = Fixture::new(replay().with_steps(1));
        let mut session = fx.session(1, quiet_config());
        let fen = crate::game::START_FEN;

        run_main(4, move |s| async move {
            let mut log = EventLog::new();
            let records = vec![
                EpdRecord::new("first", fen, mv("e2e4")),
                EpdRecord::new("second", fen, mv("d2d4")),
            ];
            session.start_autoplay(&s, AutoPlay::analyze_epd(records)).unwrap();
            assert!(tick_until(&s, &mut session, &mut log, |s| s.activity().is_idle()).await);

            match session.last_report() {
                Some(AutoPlayReport::Epd(report)) => {
                    assert_eq!(report.solved, 1);
                    assert_eq!(report.total(), 2);
                    assert!(!report.outcomes[1].solved);
                }
                other => panic!("unexpected report {:?}", other),
            }
        });
    }

    #[test]
    fn test_stale_completion_is_dropped() {
        let fx = Fixture::new(replay().with_steps(1));
        let mut session = fx.session(1, quiet_config());
        run_main(4, move |_s| async move {
            let mut log = EventLog::new();
            // A completion posted for a search that is no longer running
            session.port.post_done(99);
            assert_eq!(session.drain_engine_messages(&mut log), None);
            assert!(log.events.is_empty());
            // Each bit is delivered once
            session.port.post(EngineMessages::SCORE);
            session.drain_engine_messages(&mut log);
            session.drain_engine_messages(&mut log);
            assert_eq!(log.events.len(), 1);
        });
    }
}
