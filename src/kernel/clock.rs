//! Chess clocks
//!
//! One clock per side, started when that side begins to move and stopped
//! when the move is made. Time controls decide how much time a side gets
//! back after a move.
//!
//! Time is monotonic milliseconds supplied by the caller (see
//! `platform::TimeSource`); the clock never reads time on its own, so tests
//! can drive it with plain numbers.

use super::trace::{self, TraceCategory};
use crate::game::Color;
use serde::{Deserialize, Serialize};

/// How much thinking time each side gets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeControl {
    /// No clock at all
    Infinite,
    /// Every move gets the same budget, unused time is lost
    FixedPerMove { ms: f64 },
    /// `base_ms` for every `moves` moves; unused time carries over
    Tournament { moves: u32, base_ms: f64 },
    /// `base_ms` once, plus `increment_ms` after every move
    Fischer { base_ms: f64, increment_ms: f64 },
}

impl Default for TimeControl {
    fn default() -> Self {
        TimeControl::Fischer {
            base_ms: 300_000.0,
            increment_ms: 2_000.0,
        }
    }
}

impl TimeControl {
    /// Time on a fresh clock
    pub fn initial(&self) -> f64 {
        match *self {
            TimeControl::Infinite => f64::INFINITY,
            TimeControl::FixedPerMove { ms } => ms,
            TimeControl::Tournament { base_ms, .. } => base_ms,
            TimeControl::Fischer { base_ms, .. } => base_ms,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, TimeControl::Infinite)
    }

    /// Check that every duration is positive and finite
    pub fn is_valid(&self) -> bool {
        let ok = |ms: f64| ms.is_finite() && ms > 0.0;
        match *self {
            TimeControl::Infinite => true,
            TimeControl::FixedPerMove { ms } => ok(ms),
            TimeControl::Tournament { moves, base_ms } => moves > 0 && ok(base_ms),
            TimeControl::Fischer {
                base_ms,
                increment_ms,
            } => ok(base_ms) && increment_ms.is_finite() && increment_ms >= 0.0,
        }
    }
}

/// Clock of one side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SideClock {
    /// Time left when the clock was last stopped
    remaining: f64,
    /// When the clock was started, if it is running
    started_at: Option<f64>,
    /// Moves completed on this clock
    moves: u32,
    /// Duration of the last completed move
    last_elapsed: f64,
}

impl SideClock {
    fn new(control: &TimeControl) -> Self {
        Self {
            remaining: control.initial(),
            started_at: None,
            moves: 0,
            last_elapsed: 0.0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn moves(&self) -> u32 {
        self.moves
    }

    pub fn last_elapsed(&self) -> f64 {
        self.last_elapsed
    }

    fn elapsed(&self, now: f64) -> f64 {
        self.started_at.map_or(0.0, |start| (now - start).max(0.0))
    }
}

/// A two-sided chess clock
#[derive(Debug, Clone, PartialEq)]
pub struct ChessClock {
    control: TimeControl,
    sides: [SideClock; 2],
}

impl ChessClock {
    pub fn new(control: TimeControl) -> Self {
        Self {
            control,
            sides: [SideClock::new(&control); 2],
        }
    }

    pub fn control(&self) -> TimeControl {
        self.control
    }

    /// Change the time control and reset both sides
    pub fn set_control(&mut self, control: TimeControl) {
        self.control = control;
        self.reset();
    }

    pub fn side(&self, side: Color) -> &SideClock {
        &self.sides[side.index()]
    }

    /// The side whose clock is running
    pub fn running_side(&self) -> Option<Color> {
        Color::BOTH.into_iter().find(|&c| self.sides[c.index()].is_running())
    }

    /// Start `side`'s clock. Starting a running clock does nothing.
    pub fn start(&mut self, side: Color, now: f64) {
        let control = self.control;
        let clock = &mut self.sides[side.index()];
        if clock.is_running() {
            return;
        }
        if let TimeControl::FixedPerMove { ms } = control {
            clock.remaining = ms;
        }
        clock.started_at = Some(now);
        trace::record(TraceCategory::Clock, "start", Some(format!("{} at {:.0}", side, now)));
    }

    /// Stop `side`'s clock after a completed move, apply the time control,
    /// and return how long the move took. A stopped clock returns 0.
    pub fn stop(&mut self, side: Color, now: f64) -> f64 {
        let control = self.control;
        let clock = &mut self.sides[side.index()];
        let Some(_) = clock.started_at else {
            return 0.0;
        };

        let elapsed = clock.elapsed(now);
        clock.started_at = None;
        clock.remaining -= elapsed;
        clock.moves += 1;
        clock.last_elapsed = elapsed;

        // A fallen flag earns nothing back
        if clock.remaining > 0.0 {
            match control {
                TimeControl::Fischer { increment_ms, .. } => clock.remaining += increment_ms,
                TimeControl::Tournament { moves, base_ms } if moves > 0 && clock.moves % moves == 0 => {
                    clock.remaining += base_ms;
                }
                _ => {}
            }
        }

        trace::record(
            TraceCategory::Clock,
            "stop",
            Some(format!("{} elapsed={:.0} remaining={:.0}", side, elapsed, clock.remaining)),
        );
        elapsed
    }

    /// Stop `side`'s clock without counting a move (aborted searches)
    pub fn pause(&mut self, side: Color, now: f64) {
        let clock = &mut self.sides[side.index()];
        if clock.is_running() {
            clock.remaining -= clock.elapsed(now);
            clock.started_at = None;
        }
    }

    /// Pause whichever side is running
    pub fn pause_all(&mut self, now: f64) {
        for side in Color::BOTH {
            self.pause(side, now);
        }
    }

    /// Time left for `side` at `now`
    pub fn remaining(&self, side: Color, now: f64) -> f64 {
        let clock = &self.sides[side.index()];
        clock.remaining - clock.elapsed(now)
    }

    /// Whether `side` has run out of time
    pub fn flag_fallen(&self, side: Color, now: f64) -> bool {
        !self.control.is_infinite() && self.remaining(side, now) <= 0.0
    }

    /// Give `side` a fresh allotment. A running clock keeps running from
    /// `now`.
    pub fn reset_side(&mut self, side: Color, now: f64) {
        let initial = self.control.initial();
        let clock = &mut self.sides[side.index()];
        clock.remaining = initial;
        if clock.is_running() {
            clock.started_at = Some(now);
        }
        trace::record(TraceCategory::Clock, "reset", Some(side.to_string()));
    }

    /// Stop both clocks and restore the initial time
    pub fn reset(&mut self) {
        self.sides = [SideClock::new(&self.control); 2];
    }

    /// Time a search for `side` may spend on its next move, `None` for no
    /// limit
    pub fn move_budget(&self, side: Color, now: f64) -> Option<f64> {
        let remaining = self.remaining(side, now).max(0.0);
        match self.control {
            TimeControl::Infinite => None,
            TimeControl::FixedPerMove { ms } => Some(ms),
            TimeControl::Tournament { moves, .. } => {
                let played = self.sides[side.index()].moves;
                let to_go = moves.saturating_sub(played % moves.max(1)).max(1);
                Some(remaining / f64::from(to_go))
            }
            TimeControl::Fischer { increment_ms, .. } => Some((remaining / 30.0 + increment_ms).min(remaining)),
        }
    }
}

impl Default for ChessClock {
    fn default() -> Self {
        Self::new(TimeControl::default())
    }
}
