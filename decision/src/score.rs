//! Rolling score history for one game, from this bot's perspective.

/// Mate scores are collapsed to this finite sentinel so the draw/resign
/// thresholds can treat every evaluation as a centipawn value.
pub const MATE_SENTINEL: i32 = 40_000;

/// One engine/cloud evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eval {
    /// Centipawns from our perspective.
    Cp(i32),
    /// Mate in N plies; negative means we are getting mated.
    Mate(i32),
}

impl Eval {
    /// Collapse to a signed centipawn value with mate distances mapped to
    /// the sentinel.
    pub fn signed_cp(self) -> i32 {
        match self {
            Eval::Cp(cp) => cp,
            Eval::Mate(n) if n >= 0 => MATE_SENTINEL,
            Eval::Mate(_) => -MATE_SENTINEL,
        }
    }

    pub fn is_mate(self) -> bool {
        matches!(self, Eval::Mate(_))
    }
}

/// Append-only sequence of per-move scores; `None` marks moves produced
/// without an evaluation (book and most online sources). Grows for the
/// life of one game and is discarded at game end.
#[derive(Debug, Clone, Default)]
pub struct ScoreHistory {
    scores: Vec<Option<i32>>,
}

impl ScoreHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, eval: Option<Eval>) {
        self.scores.push(eval.map(Eval::signed_cp));
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// The most recent `n` scores, or `None` if fewer than `n` exist.
    pub fn window(&self, n: usize) -> Option<&[Option<i32>]> {
        if n == 0 || self.scores.len() < n {
            return None;
        }
        Some(&self.scores[self.scores.len() - n..])
    }

    /// Whether any recorded score was a forced mate (either side). Gates
    /// online endgame-tablebase probes, which would be wasted lookups.
    pub fn saw_forced_mate(&self) -> bool {
        self.scores
            .iter()
            .flatten()
            .any(|&s| s.abs() >= MATE_SENTINEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mate_collapses_to_sentinel() {
        assert_eq!(Eval::Mate(3).signed_cp(), MATE_SENTINEL);
        assert_eq!(Eval::Mate(-5).signed_cp(), -MATE_SENTINEL);
        assert_eq!(Eval::Cp(123).signed_cp(), 123);
    }

    #[test]
    fn window_requires_enough_scores() {
        let mut history = ScoreHistory::new();
        history.push(Some(Eval::Cp(10)));
        history.push(Some(Eval::Cp(20)));
        assert!(history.window(3).is_none());
        assert_eq!(history.window(2).unwrap(), &[Some(10), Some(20)]);
    }

    #[test]
    fn window_of_zero_is_none() {
        let history = ScoreHistory::new();
        assert!(history.window(0).is_none());
    }

    #[test]
    fn saw_forced_mate_ignores_gaps_and_cp() {
        let mut history = ScoreHistory::new();
        history.push(Some(Eval::Cp(500)));
        history.push(None);
        assert!(!history.saw_forced_mate());
        history.push(Some(Eval::Mate(-2)));
        assert!(history.saw_forced_mate());
    }
}
