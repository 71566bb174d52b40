//! Scripted engine
//!
//! Answers every position from a fixed line: at ply `n` it plays
//! `line[n]` and reports `line[n..]` as its main line. Past the end of the
//! line it has no move, and reports `end_score` (by default a mate score
//! against the side to move).
//!
//! A search takes `steps_per_search` calls to `step` before it finishes,
//! which gives the scheduler something to interleave. A ponder search
//! keeps running after that until `ponder_hit` or `stop`.

use super::{Engine, EngineId, MATE_SCORE, Score, SearchId, SearchRequest, SearchResult, StepStatus};
use crate::game::Move;
use crate::kernel::msgqueue::EngineMessages;
use std::cell::RefCell;
use std::rc::Rc;

/// Length of the main line the engine reports
const LINE_DEPTH: usize = 4;

#[derive(Debug, Clone)]
struct RunningSearch {
    id: SearchId,
    ply: usize,
    steps: u32,
    pondering: bool,
    stop_requested: bool,
    aborted: bool,
    finished: bool,
}

/// Counts of the calls made on a replay engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub starts: u32,
    pub stops: u32,
    pub aborts: u32,
    pub ponder_hits: u32,
    pub steps: u64,
}

#[derive(Debug, Clone)]
pub struct ReplayEngine {
    id: EngineId,
    name: String,
    line: Vec<Move>,
    scores: Vec<Score>,
    end_score: Score,
    steps_per_search: u32,
    search: Option<RunningSearch>,
    last_request: Option<SearchRequest>,
    calls: CallCounts,
}

impl ReplayEngine {
    pub fn new(id: EngineId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            line: Vec::new(),
            scores: Vec::new(),
            end_score: -MATE_SCORE,
            steps_per_search: 3,
            search: None,
            last_request: None,
            calls: CallCounts::default(),
        }
    }

    /// Moves to answer with, indexed by ply from the start position
    pub fn with_line(mut self, line: Vec<Move>) -> Self {
        self.line = line;
        self
    }

    /// Score to report at each ply; plies past the end use the last one
    pub fn with_scores(mut self, scores: Vec<Score>) -> Self {
        self.scores = scores;
        self
    }

    /// Score reported when the line has run out
    pub fn with_end_score(mut self, score: Score) -> Self {
        self.end_score = score;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps_per_search = steps.max(1);
        self
    }

    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    pub fn calls(&self) -> CallCounts {
        self.calls
    }

    pub fn last_request(&self) -> Option<&SearchRequest> {
        self.last_request.as_ref()
    }

    /// Whether a search (any id) is in progress
    pub fn is_busy(&self) -> bool {
        self.search.as_ref().is_some_and(|s| !s.finished)
    }

    fn score_at(&self, ply: usize) -> Score {
        if ply >= self.line.len() {
            return self.end_score;
        }
        self.scores
            .get(ply)
            .or_else(|| self.scores.last())
            .copied()
            .unwrap_or(0)
    }

    fn result_at(&self, ply: usize, depth: u32) -> SearchResult {
        let end = (ply + LINE_DEPTH).min(self.line.len());
        let main_line = self.line.get(ply..end).map(<[Move]>::to_vec).unwrap_or_default();
        SearchResult {
            best_move: self.line.get(ply).copied(),
            score: self.score_at(ply),
            main_line,
            depth,
            nodes: u64::from(depth) * 1000,
        }
    }

    fn current(&self, id: SearchId) -> Option<&RunningSearch> {
        self.search.as_ref().filter(|s| s.id == id)
    }

    fn current_mut(&mut self, id: SearchId) -> Option<&mut RunningSearch> {
        self.search.as_mut().filter(|s| s.id == id)
    }
}

impl Engine for ReplayEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, request: SearchRequest) {
        self.calls.starts += 1;
        self.search = Some(RunningSearch {
            id: request.id,
            ply: request.position.moves.len(),
            steps: 0,
            pondering: request.ponder,
            stop_requested: false,
            aborted: false,
            finished: false,
        });
        self.last_request = Some(request);
    }

    fn stop(&mut self, id: SearchId) {
        self.calls.stops += 1;
        if let Some(search) = self.current_mut(id) {
            search.stop_requested = true;
            search.pondering = false;
        }
    }

    fn abort(&mut self, id: SearchId) {
        self.calls.aborts += 1;
        if let Some(search) = self.current_mut(id)
            && !search.finished
        {
            search.aborted = true;
            search.finished = true;
        }
    }

    fn ponder_hit(&mut self, id: SearchId) {
        self.calls.ponder_hits += 1;
        if let Some(search) = self.current_mut(id) {
            search.pondering = false;
        }
    }

    fn step(&mut self, id: SearchId) -> StepStatus {
        self.calls.steps += 1;
        let limit = self.steps_per_search;
        let Some(search) = self.current_mut(id) else {
            return StepStatus::done(EngineMessages::empty());
        };
        if search.finished {
            return StepStatus::done(EngineMessages::empty());
        }

        if search.steps >= limit && search.pondering {
            // Waiting for the expected move
            return StepStatus::working(EngineMessages::empty());
        }

        search.steps += 1;
        let mut changes = EngineMessages::DEPTH | EngineMessages::NODES;
        if search.steps == 1 {
            changes |= EngineMessages::MAIN_LINE | EngineMessages::SCORE | EngineMessages::CURRENT_MOVE;
        }

        if search.stop_requested || (search.steps >= limit && !search.pondering) {
            search.finished = true;
            changes |= EngineMessages::MAIN_LINE | EngineMessages::HINT;
            return StepStatus::done(changes);
        }
        StepStatus::working(changes)
    }

    fn is_running(&self, id: SearchId) -> bool {
        self.current(id).is_some_and(|s| !s.finished)
    }

    fn was_aborted(&self, id: SearchId) -> bool {
        self.current(id).is_some_and(|s| s.aborted)
    }

    fn result(&self, id: SearchId) -> Option<SearchResult> {
        let search = self.current(id)?;
        if !search.finished || search.aborted {
            return None;
        }
        Some(self.result_at(search.ply, search.steps))
    }
}
