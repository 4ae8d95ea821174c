//! Board state owned by a single game controller.
//!
//! Wraps shakmaty with the move history and a parallel list of position
//! keys so move sources can probe repetitions against hypothetical
//! continuations without touching the authoritative state.

use shakmaty::{
    fen::Fen, uci::UciMove, CastlingMode, Chess, Color, EnPassantMode, Move, MoveList, Position,
};
use thiserror::Error;

/// Errors from parsing or applying moves and positions.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("invalid FEN '{0}'")]
    InvalidFen(String),

    #[error("invalid UCI move '{0}'")]
    InvalidUci(String),

    #[error("illegal move '{0}' in current position")]
    IllegalMove(String),
}

/// The full position plus move history for one game.
///
/// Mutated only by applying our chosen move or moves reported by the
/// server. Cloning takes an immutable snapshot for hypothetical probes.
#[derive(Debug, Clone)]
pub struct Board {
    position: Chess,
    moves: Vec<UciMove>,
    /// Position keys (FEN minus move counters) seen so far, including
    /// the starting position. Used for repetition checks.
    keys: Vec<String>,
}

impl Default for Board {
    fn default() -> Self {
        Self::startpos()
    }
}

impl Board {
    /// Standard starting position.
    pub fn startpos() -> Self {
        let position = Chess::default();
        let keys = vec![position_key(&position)];
        Self {
            position,
            moves: Vec::new(),
            keys,
        }
    }

    /// Position from a FEN string (custom initial positions).
    pub fn from_fen(fen: &str) -> Result<Self, BoardError> {
        let parsed: Fen = fen
            .parse()
            .map_err(|_| BoardError::InvalidFen(fen.to_string()))?;
        let position: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|_| BoardError::InvalidFen(fen.to_string()))?;
        let keys = vec![position_key(&position)];
        Ok(Self {
            position,
            moves: Vec::new(),
            keys,
        })
    }

    /// Apply a move in UCI notation, validating legality.
    pub fn play_uci(&mut self, uci: &str) -> Result<(), BoardError> {
        let parsed: UciMove = uci
            .parse()
            .map_err(|_| BoardError::InvalidUci(uci.to_string()))?;
        let m = parsed
            .to_move(&self.position)
            .map_err(|_| BoardError::IllegalMove(uci.to_string()))?;
        self.position = self
            .position
            .clone()
            .play(&m)
            .map_err(|_| BoardError::IllegalMove(uci.to_string()))?;
        self.moves.push(parsed);
        self.keys.push(position_key(&self.position));
        Ok(())
    }

    /// Resolve a UCI move against the current position without applying it.
    pub fn to_move(&self, uci: &UciMove) -> Result<Move, BoardError> {
        uci.to_move(&self.position)
            .map_err(|_| BoardError::IllegalMove(uci.to_string()))
    }

    /// Whether playing `m` would recreate a position already seen.
    pub fn would_repeat(&self, m: &Move) -> bool {
        match self.position.clone().play(m) {
            Ok(next) => self.keys.contains(&position_key(&next)),
            Err(_) => false,
        }
    }

    pub fn position(&self) -> &Chess {
        &self.position
    }

    pub fn legal_moves(&self) -> MoveList {
        self.position.legal_moves()
    }

    /// Number of plies played so far.
    pub fn moves_played(&self) -> usize {
        self.moves.len()
    }

    pub fn move_history(&self) -> &[UciMove] {
        &self.moves
    }

    pub fn turn(&self) -> Color {
        self.position.turn()
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.position.halfmoves()
    }

    pub fn fullmoves(&self) -> u32 {
        self.position.fullmoves().get()
    }

    /// Total pieces on the board (both sides), for tablebase gating.
    pub fn piece_count(&self) -> usize {
        self.position.board().occupied().count()
    }

    /// How many times the current position has occurred in this game,
    /// including right now.
    pub fn repetition_count(&self) -> usize {
        match self.keys.last() {
            Some(current) => self.keys.iter().filter(|k| *k == current).count(),
            None => 0,
        }
    }

    /// Neither side has mating material.
    pub fn insufficient_material(&self) -> bool {
        self.position.has_insufficient_material(Color::White)
            && self.position.has_insufficient_material(Color::Black)
    }

    /// Full FEN for the current position.
    pub fn fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }
}

/// FEN restricted to the fields that identify a position for repetition
/// purposes (board, side to move, castling rights, en passant square).
fn position_key(position: &Chess) -> String {
    let fen = Fen::from_position(position.clone(), EnPassantMode::Legal).to_string();
    fen.split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}
