//! Per-game clock tracking and engine time-budget computation.
//!
//! Pure computation, no I/O. The controller updates the clock from every
//! server state event; online lookups charge their real elapsed wall time
//! against the own clock so the model never drifts from reality.

use std::time::Duration;

/// Fixed budget for the first move of each side, before the move history
/// exists. Book/online sources are expected to answer first; the engine
/// call here is a safety net, so pondering is disabled.
pub const FIRST_MOVE_BUDGET: Duration = Duration::from_secs(15);

/// Remaining time for both sides plus the per-move increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub own: Duration,
    pub opponent: Duration,
    pub increment: Duration,
}

/// Search limit handed to the engine for one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkLimit {
    pub total: Duration,
    pub ponder: bool,
}

impl ClockState {
    pub fn new(own: Duration, opponent: Duration, increment: Duration) -> Self {
        Self {
            own,
            opponent,
            increment,
        }
    }

    pub fn from_millis(own_ms: u64, opponent_ms: u64, increment_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(own_ms),
            Duration::from_millis(opponent_ms),
            Duration::from_millis(increment_ms),
        )
    }

    /// Replace both clocks from a server state update. Clamped at zero by
    /// construction since `Duration` cannot be negative.
    pub fn update(&mut self, own: Duration, opponent: Duration) {
        self.own = own;
        self.opponent = opponent;
    }

    /// Charge elapsed wall time against the own clock. Used by online
    /// lookups so a timed-out call still consumes the time it burned.
    pub fn charge(&mut self, elapsed: Duration) {
        self.own = self.own.saturating_sub(elapsed);
    }

    /// Time budget for the engine on the current move.
    ///
    /// The first two plies of the game get a fixed generous budget with
    /// pondering off. After that: subtract the configured move overhead
    /// if we can afford it, otherwise halve what is left. The result is
    /// strictly positive while any own time remains, shrinking as the
    /// clock runs low, so the bot cannot flag itself.
    pub fn think_budget(&self, moves_played: usize, overhead: Duration) -> ThinkLimit {
        if moves_played < 2 {
            return ThinkLimit {
                total: FIRST_MOVE_BUDGET,
                ponder: false,
            };
        }
        let total = if self.own > overhead {
            self.own - overhead
        } else {
            self.own / 2
        };
        ThinkLimit {
            total,
            ponder: true,
        }
    }

    /// Whether the opponent is critically low without increment to bail
    /// them out. Gates draw offers and resignations.
    pub fn opponent_low_no_increment(&self, threshold: Duration) -> bool {
        self.increment.is_zero() && self.opponent < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn budget_subtracts_overhead_when_affordable() {
        let clock = ClockState::new(secs(60), secs(60), secs(1));
        let limit = clock.think_budget(10, Duration::from_millis(500));
        assert_eq!(limit.total, Duration::from_millis(59_500));
        assert!(limit.total < clock.own);
        assert!(limit.total > Duration::ZERO);
        assert!(limit.ponder);
    }

    #[test]
    fn budget_halves_when_overhead_exceeds_remaining() {
        let clock = ClockState::new(Duration::from_millis(400), secs(60), Duration::ZERO);
        let limit = clock.think_budget(10, Duration::from_millis(500));
        assert_eq!(limit.total, Duration::from_millis(200));
    }

    #[test]
    fn budget_halves_when_overhead_equals_remaining() {
        let clock = ClockState::new(Duration::from_millis(500), secs(60), Duration::ZERO);
        let limit = clock.think_budget(10, Duration::from_millis(500));
        assert_eq!(limit.total, Duration::from_millis(250));
    }

    #[test]
    fn first_two_plies_use_fixed_budget_without_ponder() {
        let clock = ClockState::new(secs(180), secs(180), secs(2));
        for moves_played in [0, 1] {
            let limit = clock.think_budget(moves_played, Duration::from_millis(100));
            assert_eq!(limit.total, FIRST_MOVE_BUDGET);
            assert!(!limit.ponder);
        }
        let limit = clock.think_budget(2, Duration::from_millis(100));
        assert_ne!(limit.total, FIRST_MOVE_BUDGET);
    }

    #[test]
    fn charge_saturates_at_zero() {
        let mut clock = ClockState::new(secs(1), secs(60), Duration::ZERO);
        clock.charge(secs(5));
        assert_eq!(clock.own, Duration::ZERO);
    }

    #[test]
    fn charge_reflects_elapsed_time() {
        let mut clock = ClockState::new(secs(10), secs(60), Duration::ZERO);
        clock.charge(secs(2));
        assert_eq!(clock.own, secs(8));
    }

    #[test]
    fn opponent_low_time_gate_requires_no_increment() {
        let no_inc = ClockState::new(secs(60), secs(5), Duration::ZERO);
        assert!(no_inc.opponent_low_no_increment(secs(10)));

        let with_inc = ClockState::new(secs(60), secs(5), secs(2));
        assert!(!with_inc.opponent_low_no_increment(secs(10)));
    }
}
