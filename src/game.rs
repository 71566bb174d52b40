//! Game record
//!
//! The minimal game model the engine-task lifecycle needs: a starting
//! position, the moves applied so far (with a cursor for take back and
//! replay), the side to move, and the result once the game is over.
//!
//! Board rules are not modelled here. Positions are opaque FEN text handed
//! to the engine together with the move list, and moves are only checked
//! for well-formed coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// FEN of the standard starting position
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Side to move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// Both colors in index order (White=0, Black=1)
    pub const BOTH: [Color; 2] = [Color::White, Color::Black];

    pub const fn index(self) -> usize {
        match self {
            Color::White => 0,
            Color::Black => 1,
        }
    }

    pub const fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// Board square, 0 = a1 .. 63 = h8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Square(u8);

impl Square {
    pub fn new(index: u8) -> Option<Square> {
        (index < 64).then_some(Square(index))
    }

    pub fn from_coords(file: u8, rank: u8) -> Option<Square> {
        (file < 8 && rank < 8).then_some(Square(rank * 8 + file))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn file(self) -> u8 {
        self.0 % 8
    }

    pub fn rank(self) -> u8 {
        self.0 / 8
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'a' + self.file()) as char, (b'1' + self.rank()) as char)
    }
}

/// Piece a pawn promotes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Promotion {
    Knight,
    Bishop,
    Rook,
    Queen,
}

impl Promotion {
    fn letter(self) -> char {
        match self {
            Promotion::Knight => 'n',
            Promotion::Bishop => 'b',
            Promotion::Rook => 'r',
            Promotion::Queen => 'q',
        }
    }

    fn from_letter(c: char) -> Option<Promotion> {
        match c.to_ascii_lowercase() {
            'n' => Some(Promotion::Knight),
            'b' => Some(Promotion::Bishop),
            'r' => Some(Promotion::Rook),
            'q' => Some(Promotion::Queen),
            _ => None,
        }
    }
}

/// A move in coordinate form ("e2e4", "e7e8q")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Move {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Promotion>,
}

impl Move {
    pub fn new(from: Square, to: Square) -> Self {
        Self {
            from,
            to,
            promotion: None,
        }
    }

    pub fn with_promotion(mut self, promotion: Promotion) -> Self {
        self.promotion = Some(promotion);
        self
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)?;
        if let Some(p) = self.promotion {
            write!(f, "{}", p.letter())?;
        }
        Ok(())
    }
}

/// Error parsing a coordinate move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveParseError(pub String);

impl fmt::Display for MoveParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid move: {}", self.0)
    }
}

impl std::error::Error for MoveParseError {}

fn parse_square(file: u8, rank: u8) -> Option<Square> {
    if !(b'a'..=b'h').contains(&file) || !(b'1'..=b'8').contains(&rank) {
        return None;
    }
    Square::from_coords(file - b'a', rank - b'1')
}

impl FromStr for Move {
    type Err = MoveParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.trim().as_bytes();
        if bytes.len() != 4 && bytes.len() != 5 {
            return Err(MoveParseError(s.to_string()));
        }
        let from = parse_square(bytes[0], bytes[1]).ok_or_else(|| MoveParseError(s.to_string()))?;
        let to = parse_square(bytes[2], bytes[3]).ok_or_else(|| MoveParseError(s.to_string()))?;
        let promotion = match bytes.get(4) {
            None => None,
            Some(&c) => Some(Promotion::from_letter(c as char).ok_or_else(|| MoveParseError(s.to_string()))?),
        };
        Ok(Move { from, to, promotion })
    }
}

/// Why a game ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultReason {
    Checkmate,
    Stalemate,
    Resignation,
    TimeForfeit,
    DrawAgreed,
    Adjudicated,
}

/// Final result of a game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameResult {
    Win { winner: Color, reason: ResultReason },
    Draw { reason: ResultReason },
}

impl GameResult {
    pub fn winner(&self) -> Option<Color> {
        match self {
            GameResult::Win { winner, .. } => Some(*winner),
            GameResult::Draw { .. } => None,
        }
    }

    pub fn reason(&self) -> ResultReason {
        match self {
            GameResult::Win { reason, .. } | GameResult::Draw { reason } => *reason,
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.winner() {
            Some(Color::White) => write!(f, "1-0"),
            Some(Color::Black) => write!(f, "0-1"),
            None => write!(f, "1/2-1/2"),
        }
    }
}

/// What the engine is given to search: a start position and the moves
/// played from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub start_fen: String,
    pub moves: Vec<Move>,
}

/// A game being played or analysed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    start_fen: String,
    start_side: Color,
    moves: Vec<Move>,
    /// Number of moves currently applied (moves past it can be replayed)
    cursor: usize,
    result: Option<GameResult>,
}

impl Game {
    /// A game from the standard starting position
    pub fn new() -> Self {
        Self::from_fen(START_FEN)
    }

    /// A game from an arbitrary position; the side to move is read from the
    /// FEN's second field and defaults to white
    pub fn from_fen(fen: &str) -> Self {
        let start_side = match fen.split_whitespace().nth(1) {
            Some("b") => Color::Black,
            _ => Color::White,
        };
        Self {
            start_fen: fen.to_string(),
            start_side,
            moves: Vec::new(),
            cursor: 0,
            result: None,
        }
    }

    /// A finished game record, positioned at its end
    pub fn from_moves(fen: &str, moves: Vec<Move>) -> Self {
        let mut game = Self::from_fen(fen);
        game.cursor = moves.len();
        game.moves = moves;
        game
    }

    pub fn start_fen(&self) -> &str {
        &self.start_fen
    }

    pub fn side_to_move(&self) -> Color {
        if self.cursor % 2 == 0 {
            self.start_side
        } else {
            self.start_side.opponent()
        }
    }

    /// Moves applied up to the cursor
    pub fn played(&self) -> &[Move] {
        &self.moves[..self.cursor]
    }

    pub fn ply(&self) -> usize {
        self.cursor
    }

    pub fn total_plies(&self) -> usize {
        self.moves.len()
    }

    pub fn last_move(&self) -> Option<Move> {
        self.played().last().copied()
    }

    pub fn result(&self) -> Option<GameResult> {
        self.result
    }

    pub fn is_over(&self) -> bool {
        self.result.is_some()
    }

    pub fn set_result(&mut self, result: GameResult) {
        self.result = Some(result);
    }

    /// Play a move at the cursor, discarding any moves that could have
    /// been replayed from here
    pub fn push(&mut self, mv: Move) {
        self.moves.truncate(self.cursor);
        self.moves.push(mv);
        self.cursor += 1;
    }

    /// Retract the last move played, keeping it available for replay
    pub fn take_back(&mut self) -> Option<Move> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.result = None;
        Some(self.moves[self.cursor])
    }

    /// Retract the last move and forget it
    pub fn retract(&mut self) -> Option<Move> {
        let mv = self.take_back()?;
        self.moves.truncate(self.cursor);
        Some(mv)
    }

    /// Replay the next recorded move
    pub fn replay(&mut self) -> Option<Move> {
        let mv = *self.moves.get(self.cursor)?;
        self.cursor += 1;
        Some(mv)
    }

    /// Move the cursor back to the start position
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Forget every move and result, keeping the start position
    pub fn restart(&mut self) {
        self.moves.clear();
        self.cursor = 0;
        self.result = None;
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            start_fen: self.start_fen.clone(),
            moves: self.played().to_vec(),
        }
    }
}

impl Default for Game {
    fn default() -> Self {
        Self::new()
    }
}
