//! Automated play
//!
//! The AutoPlaying activity runs a sequence of searches. The lifecycle
//! starts each search and applies its result; the controller here decides
//! what the sequence is: which position comes next, when a game is over
//! for good, and what gets recorded along the way.

use super::state::AutoPlayMode;
use crate::engine::{Score, SearchResult};
use crate::game::{Color, Game, GameResult, Move};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One finished game of a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchGame {
    pub number: u32,
    /// Colour the session's own engine played
    pub engine_color: Color,
    pub result: GameResult,
    pub plies: usize,
}

/// Running score of an engine match, from the session engine's side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub games_planned: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub games: Vec<MatchGame>,
}

impl MatchStats {
    pub fn new(games_planned: u32) -> Self {
        Self {
            games_planned,
            wins: 0,
            draws: 0,
            losses: 0,
            games: Vec::new(),
        }
    }

    pub fn games_played(&self) -> u32 {
        self.wins + self.draws + self.losses
    }

    pub fn is_complete(&self) -> bool {
        self.games_played() >= self.games_planned
    }

    /// Match points: 1 per win, 1/2 per draw
    pub fn points(&self) -> f64 {
        f64::from(self.wins) + f64::from(self.draws) * 0.5
    }

    pub fn record(&mut self, engine_color: Color, result: GameResult, plies: usize) {
        match result.winner() {
            Some(winner) if winner == engine_color => self.wins += 1,
            Some(_) => self.losses += 1,
            None => self.draws += 1,
        }
        let number = self.games_played();
        self.games.push(MatchGame {
            number,
            engine_color,
            result,
            plies,
        });
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Engine verdict on one position of an analysed game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub ply: usize,
    pub score: Score,
    pub best_move: Option<Move>,
    pub main_line: Vec<Move>,
}

impl Annotation {
    pub fn from_result(ply: usize, result: &SearchResult) -> Self {
        Self {
            ply,
            score: result.score,
            best_move: result.best_move,
            main_line: result.main_line.clone(),
        }
    }
}

/// A test position with a known best move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpdRecord {
    pub id: String,
    pub fen: String,
    pub expected: Move,
}

impl EpdRecord {
    pub fn new(id: &str, fen: &str, expected: Move) -> Self {
        Self {
            id: id.to_string(),
            fen: fen.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpdOutcome {
    pub id: String,
    pub expected: Move,
    pub found: Option<Move>,
    pub solved: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EpdReport {
    pub solved: u32,
    pub outcomes: Vec<EpdOutcome>,
}

impl EpdReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }
}

/// What a finished automated run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutoPlayReport {
    /// Plain or demo play
    Played { games: u32 },
    Match(MatchStats),
    /// One list of annotations per analysed game
    Analysis { games: Vec<Vec<Annotation>> },
    Epd(EpdReport),
}

/// What to do after a search of an automated run completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStep {
    /// Search the (possibly new) current position
    Continue,
    /// The run is over
    Finished,
}

#[derive(Debug, Clone)]
enum Job {
    Plain {
        games: u32,
    },
    Demo {
        games: u32,
    },
    Match {
        stats: MatchStats,
        engine_color: Color,
        alternate_colors: bool,
    },
    AnalyzeGame {
        annotations: Vec<Annotation>,
    },
    AnalyzeCollection {
        pending: VecDeque<Game>,
        done: Vec<Vec<Annotation>>,
        annotations: Vec<Annotation>,
    },
    AnalyzeEpd {
        pending: VecDeque<EpdRecord>,
        current: Option<EpdRecord>,
        report: EpdReport,
    },
}

/// Controller of one automated run
#[derive(Debug, Clone)]
pub struct AutoPlay {
    job: Job,
}

impl AutoPlay {
    pub fn plain() -> Self {
        Self {
            job: Job::Plain { games: 0 },
        }
    }

    pub fn demo() -> Self {
        Self {
            job: Job::Demo { games: 0 },
        }
    }

    /// `games` games, the session's engine starting as `engine_color`
    pub fn engine_match(games: u32, engine_color: Color, alternate_colors: bool) -> Self {
        Self {
            job: Job::Match {
                stats: MatchStats::new(games),
                engine_color,
                alternate_colors,
            },
        }
    }

    pub fn analyze_game() -> Self {
        Self {
            job: Job::AnalyzeGame {
                annotations: Vec::new(),
            },
        }
    }

    pub fn analyze_collection(games: Vec<Game>) -> Self {
        Self {
            job: Job::AnalyzeCollection {
                pending: games.into(),
                done: Vec::new(),
                annotations: Vec::new(),
            },
        }
    }

    pub fn analyze_epd(records: Vec<EpdRecord>) -> Self {
        Self {
            job: Job::AnalyzeEpd {
                pending: records.into(),
                current: None,
                report: EpdReport::default(),
            },
        }
    }

    pub fn mode(&self) -> AutoPlayMode {
        match self.job {
            Job::Plain { .. } => AutoPlayMode::Plain,
            Job::Demo { .. } => AutoPlayMode::DemoPlay,
            Job::Match { .. } => AutoPlayMode::EngineMatch,
            Job::AnalyzeGame { .. } => AutoPlayMode::AnalyzeGame,
            Job::AnalyzeCollection { .. } => AutoPlayMode::AnalyzeCollection,
            Job::AnalyzeEpd { .. } => AutoPlayMode::AnalyzeEpd,
        }
    }

    /// Colour played by the session's own engine in a match. The other
    /// colour is played by the opponent engine.
    pub fn engine_color(&self) -> Option<Color> {
        match &self.job {
            Job::Match { engine_color, .. } => Some(*engine_color),
            _ => None,
        }
    }

    pub fn match_stats(&self) -> Option<&MatchStats> {
        match &self.job {
            Job::Match { stats, .. } => Some(stats),
            _ => None,
        }
    }

    /// Set up the game for the first search. Returns false when there is
    /// nothing to do (empty collection, finished match).
    pub fn prepare(&mut self, game: &mut Game) -> bool {
        match &mut self.job {
            Job::Plain { .. } | Job::Demo { .. } => !game.is_over(),
            Job::Match { stats, .. } => {
                if stats.is_complete() {
                    return false;
                }
                game.restart();
                true
            }
            Job::AnalyzeGame { .. } => {
                game.rewind();
                true
            }
            Job::AnalyzeCollection { pending, .. } => match pending.pop_front() {
                Some(mut next) => {
                    next.rewind();
                    *game = next;
                    true
                }
                None => false,
            },
            Job::AnalyzeEpd { pending, current, .. } => match pending.pop_front() {
                Some(record) => {
                    *game = Game::from_fen(&record.fen);
                    *current = Some(record);
                    true
                }
                None => false,
            },
        }
    }

    /// A game played by one of the playing modes ended with `result`.
    /// Sets up the next game when the run goes on.
    pub fn game_finished(&mut self, game: &mut Game, result: GameResult) -> AutoStep {
        match &mut self.job {
            Job::Plain { games } => {
                *games += 1;
                AutoStep::Finished
            }
            Job::Demo { games } => {
                *games += 1;
                game.restart();
                AutoStep::Continue
            }
            Job::Match {
                stats,
                engine_color,
                alternate_colors,
            } => {
                stats.record(*engine_color, result, game.total_plies());
                if stats.is_complete() {
                    return AutoStep::Finished;
                }
                if *alternate_colors {
                    *engine_color = engine_color.opponent();
                }
                game.restart();
                AutoStep::Continue
            }
            // Analysis never plays moves, so it never ends a game
            _ => AutoStep::Finished,
        }
    }

    /// An analysis search on the game's current position completed
    pub fn analysis_done(&mut self, game: &mut Game, result: &SearchResult) -> AutoStep {
        match &mut self.job {
            Job::AnalyzeGame { annotations } => {
                annotations.push(Annotation::from_result(game.ply(), result));
                match game.replay() {
                    Some(_) => AutoStep::Continue,
                    None => AutoStep::Finished,
                }
            }
            Job::AnalyzeCollection {
                pending,
                done,
                annotations,
            } => {
                annotations.push(Annotation::from_result(game.ply(), result));
                if game.replay().is_some() {
                    return AutoStep::Continue;
                }
                done.push(std::mem::take(annotations));
                match pending.pop_front() {
                    Some(mut next) => {
                        next.rewind();
                        *game = next;
                        AutoStep::Continue
                    }
                    None => AutoStep::Finished,
                }
            }
            Job::AnalyzeEpd {
                pending,
                current,
                report,
            } => {
                if let Some(record) = current.take() {
                    let solved = result.best_move == Some(record.expected);
                    if solved {
                        report.solved += 1;
                    }
                    report.outcomes.push(EpdOutcome {
                        id: record.id,
                        expected: record.expected,
                        found: result.best_move,
                        solved,
                    });
                }
                match pending.pop_front() {
                    Some(record) => {
                        *game = Game::from_fen(&record.fen);
                        *current = Some(record);
                        AutoStep::Continue
                    }
                    None => AutoStep::Finished,
                }
            }
            _ => AutoStep::Finished,
        }
    }

    /// Summary of the run so far
    pub fn report(&self) -> AutoPlayReport {
        match &self.job {
            Job::Plain { games } | Job::Demo { games } => AutoPlayReport::Played { games: *games },
            Job::Match { stats, .. } => AutoPlayReport::Match(stats.clone()),
            Job::AnalyzeGame { annotations } => AutoPlayReport::Analysis {
                games: vec![annotations.clone()],
            },
            Job::AnalyzeCollection {
                done, annotations, ..
            } => {
                let mut games = done.clone();
                if !annotations.is_empty() {
                    games.push(annotations.clone());
                }
                AutoPlayReport::Analysis { games }
            }
            Job::AnalyzeEpd { report, .. } => AutoPlayReport::Epd(report.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::ResultReason;

    fn mv(s: &str) -> Move {
        s.parse().unwrap()
    }

    fn white_wins() -> GameResult {
        GameResult::Win {
            winner: Color::White,
            reason: ResultReason::Checkmate,
        }
    }

    fn result_with(best: Option<&str>, score: Score) -> SearchResult {
        SearchResult {
            best_move: best.map(mv),
            score,
            ..Default::default()
        }
    }

    #[test]
    fn test_match_alternates_colors() {
        let mut auto = AutoPlay::engine_match(3, Color::White, true);
        let mut game = Game::new();
        assert!(auto.prepare(&mut game));

        assert_eq!(auto.game_finished(&mut game, white_wins()), AutoStep::Continue);
        assert_eq!(auto.engine_color(), Some(Color::Black));
        assert_eq!(auto.game_finished(&mut game, white_wins()), AutoStep::Continue);
        assert_eq!(auto.engine_color(), Some(Color::White));
        assert_eq!(
            auto.game_finished(&mut game, GameResult::Draw { reason: ResultReason::DrawAgreed }),
            AutoStep::Finished
        );

        let stats = auto.match_stats().unwrap();
        assert_eq!((stats.wins, stats.draws, stats.losses), (1, 1, 1));
        assert_eq!(stats.points(), 1.5);
        assert_eq!(stats.games[1].engine_color, Color::Black);
        assert!(stats.is_complete());
    }

    #[test]
    fn test_match_without_alternation() {
        let mut auto = AutoPlay::engine_match(2, Color::Black, false);
        let mut game = Game::new();
        auto.game_finished(&mut game, white_wins());
        assert_eq!(auto.engine_color(), Some(Color::Black));
        assert_eq!(auto.match_stats().unwrap().losses, 1);
    }

    #[test]
    fn test_match_stats_json() {
        let mut stats = MatchStats::new(2);
        stats.record(Color::White, white_wins(), 41);
        let json = stats.to_json();
        let back: MatchStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
        assert!(json.contains("\"wins\": 1"));
    }

    #[test]
    fn test_demo_restarts_game() {
        let mut auto = AutoPlay::demo();
        let mut game = Game::new();
        game.push(mv("e2e4"));
        game.set_result(white_wins());
        assert_eq!(auto.game_finished(&mut game, white_wins()), AutoStep::Continue);
        assert_eq!(game.total_plies(), 0);
        assert!(!game.is_over());
        assert_eq!(auto.report(), AutoPlayReport::Played { games: 1 });
    }

    #[test]
    fn test_plain_stops_after_game() {
        let mut auto = AutoPlay::plain();
        let mut game = Game::new();
        assert_eq!(auto.game_finished(&mut game, white_wins()), AutoStep::Finished);
    }

    #[test]
    fn test_analyze_game_visits_every_position() {
        let mut game = Game::from_moves(crate::game::START_FEN, vec![mv("e2e4"), mv("e7e5")]);
        let mut auto = AutoPlay::analyze_game();
        assert!(auto.prepare(&mut game));
        assert_eq!(game.ply(), 0);

        let r = result_with(Some("e2e4"), 10);
        assert_eq!(auto.analysis_done(&mut game, &r), AutoStep::Continue);
        assert_eq!(auto.analysis_done(&mut game, &r), AutoStep::Continue);
        assert_eq!(auto.analysis_done(&mut game, &r), AutoStep::Finished);

        // Moves are untouched
        assert_eq!(game.total_plies(), 2);
        match auto.report() {
            AutoPlayReport::Analysis { games } => {
                let plies: Vec<usize> = games[0].iter().map(|a| a.ply).collect();
                assert_eq!(plies, vec![0, 1, 2]);
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_analyze_collection_moves_through_games() {
        let games = vec![
            Game::from_moves(crate::game::START_FEN, vec![mv("d2d4")]),
            Game::from_moves(crate::game::START_FEN, vec![]),
        ];
        let mut auto = AutoPlay::analyze_collection(games);
        let mut game = Game::new();
        assert!(auto.prepare(&mut game));

        let r = result_with(None, 0);
        assert_eq!(auto.analysis_done(&mut game, &r), AutoStep::Continue);
        assert_eq!(auto.analysis_done(&mut game, &r), AutoStep::Continue);
        assert_eq!(auto.analysis_done(&mut game, &r), AutoStep::Finished);

        match auto.report() {
            AutoPlayReport::Analysis { games } => {
                assert_eq!(games.len(), 2);
                assert_eq!(games[0].len(), 2);
                assert_eq!(games[1].len(), 1);
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_empty_collection_has_nothing_to_do() {
        let mut auto = AutoPlay::analyze_collection(Vec::new());
        assert!(!auto.prepare(&mut Game::new()));
    }

    #[test]
    fn test_epd_counts_solved() {
        let fen = "4k3/8/8/8/8/8/8/4K2R w K - 0 1";
        let records = vec![
            EpdRecord::new("a", fen, mv("h1h8")),
            EpdRecord::new("b", fen, mv("e1g1")),
        ];
        let mut auto = AutoPlay::analyze_epd(records);
        let mut game = Game::new();
        assert!(auto.prepare(&mut game));
        assert_eq!(game.start_fen(), fen);

        assert_eq!(
            auto.analysis_done(&mut game, &result_with(Some("h1h8"), 500)),
            AutoStep::Continue
        );
        assert_eq!(
            auto.analysis_done(&mut game, &result_with(Some("h1h7"), 500)),
            AutoStep::Finished
        );

        match auto.report() {
            AutoPlayReport::Epd(report) => {
                assert_eq!(report.solved, 1);
                assert_eq!(report.total(), 2);
                assert_eq!(report.outcomes[1].found, Some(mv("h1h7")));
            }
            other => panic!("unexpected report {:?}", other),
        }
    }
}
