//! Match Reconciler
//!
//! Keeps a consistent local view of exactly one match and at most one
//! tournament. The server may send partial, stale, duplicated or foreign
//! updates; the precedence rules in [`MatchReconciler::apply_state`] decide
//! which of them reach the snapshot the render layer reads.
//!
//! # Precedence
//!
//! 1. Updates carrying `finished` status, or naming one of the recently
//!    finished matches, are ignored.
//! 2. While a match is tracked, updates naming another identifier are ignored.
//! 3. Otherwise the snapshot is replaced wholesale; the first accepted
//!    identifier becomes the tracked one.

use std::collections::VecDeque;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::game::state::{GameOver, Match, MatchStatus, Tournament};

/// How many finished match identifiers are remembered.
const FINISHED_HISTORY: usize = 16;

/// Result of applying one match-state update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Snapshot replaced.
    Applied,
    /// Update dropped because the match is finished.
    IgnoredFinished,
    /// Update dropped because another match is tracked.
    IgnoredForeign,
}

/// Local mirror of the current match and tournament.
pub struct MatchReconciler {
    /// Tracked match identifier, observable for create/join confirmation.
    match_id: watch::Sender<Option<String>>,
    /// Latest accepted snapshot.
    current: Option<Match>,
    /// Identifiers of the most recent matches known to be over.
    finished: VecDeque<String>,
    /// Final payload of the last `game_over`, read once.
    game_over: Option<GameOver>,
    /// Tournament identifier, observable for create/join confirmation.
    tournament_id: watch::Sender<Option<String>>,
    /// Tournament membership.
    tournament: Option<Tournament>,
    /// A tournament create/join is in flight or a tournament is running.
    in_tournament: bool,
    /// Summary of the last `tournament_end`, read once.
    tournament_end: Option<String>,
    /// Last countdown value announced by the server.
    countdown: Option<u32>,
}

impl Default for MatchReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchReconciler {
    /// Create an empty reconciler.
    pub fn new() -> Self {
        let (match_id, _) = watch::channel(None);
        let (tournament_id, _) = watch::channel(None);
        Self {
            match_id,
            current: None,
            finished: VecDeque::with_capacity(FINISHED_HISTORY),
            game_over: None,
            tournament_id,
            tournament: None,
            in_tournament: false,
            tournament_end: None,
            countdown: None,
        }
    }

    // =========================================================================
    // MATCH
    // =========================================================================

    /// Apply a `game_state` update.
    pub fn apply_state(&mut self, update: Match) -> ApplyOutcome {
        if update.status.is_finished() {
            debug!("Ignoring finished state update for {}", update.id);
            self.remember_finished(update.id);
            return ApplyOutcome::IgnoredFinished;
        }
        if self.finished.contains(&update.id) {
            debug!("Ignoring update for finished match {}", update.id);
            return ApplyOutcome::IgnoredFinished;
        }

        match self.tracked_id() {
            Some(tracked) if tracked != update.id => {
                debug!("Ignoring update for {} while tracking {}", update.id, tracked);
                return ApplyOutcome::IgnoredForeign;
            }
            Some(_) => {}
            None => {
                info!("Tracking match {}", update.id);
                self.match_id.send_replace(Some(update.id.clone()));
            }
        }

        self.current = Some(update);
        ApplyOutcome::Applied
    }

    /// Bind an identifier from a `game_created` acknowledgment.
    ///
    /// Identifiers naming a tournament, or any acknowledgment while a
    /// tournament request is pending, bind the tournament instead.
    pub fn bind_created(&mut self, id: String) {
        if self.in_tournament || id.contains("Tournament") {
            info!("Tournament bound: {}", id);
            if let Some(tournament) = self.tournament.as_mut() {
                tournament.id = id.clone();
            }
            self.tournament_id.send_replace(Some(id));
            return;
        }

        info!("Match bound: {}", id);
        if self.current.as_ref().is_some_and(|m| m.id != id) {
            self.current = None;
        }
        self.match_id.send_replace(Some(id));
    }

    /// Apply a `game_over` notice: stop tracking and keep the payload.
    pub fn apply_game_over(&mut self, payload: GameOver) {
        info!("Game over: {:?}", payload.game_id);
        if let Some(current) = self.current.take() {
            self.remember_finished(current.id);
        }
        if let Some(id) = payload.game_id.clone() {
            self.remember_finished(id);
        }
        self.match_id.send_replace(None);
        self.game_over = Some(payload);
    }

    /// Apply a `countdown` notice.
    pub fn apply_countdown(&mut self, value: u32) {
        self.countdown = Some(value);
        if let Some(current) = self.current.as_mut() {
            if current.status == MatchStatus::Countdown {
                current.countdown = Some(value);
            }
        }
    }

    /// Forget the tracked match before issuing a create/join.
    ///
    /// Returns the identifier tracked until now.
    pub fn begin_match_request(&mut self) -> Option<String> {
        let prior = self.match_id.send_replace(None);
        self.current = None;
        self.game_over = None;
        prior
    }

    /// Abandon the current match.
    pub fn clear_match(&mut self) {
        self.match_id.send_replace(None);
        self.current = None;
        self.game_over = None;
        self.countdown = None;
    }

    /// Snapshot of the tracked match.
    pub fn current_match(&self) -> Option<Match> {
        self.current.clone()
    }

    /// Tracked match identifier.
    pub fn tracked_id(&self) -> Option<String> {
        self.match_id.borrow().clone()
    }

    /// Take the last `game_over` payload. Returns it exactly once.
    pub fn take_game_over(&mut self) -> Option<GameOver> {
        self.game_over.take()
    }

    /// Whether a `game_over` payload is waiting to be read.
    pub fn has_game_over(&self) -> bool {
        self.game_over.is_some()
    }

    /// Last countdown value.
    pub fn countdown(&self) -> Option<u32> {
        self.countdown
    }

    /// Observe the tracked match identifier.
    pub fn subscribe_match_id(&self) -> watch::Receiver<Option<String>> {
        self.match_id.subscribe()
    }

    // =========================================================================
    // TOURNAMENT
    // =========================================================================

    /// Forget the tournament identifier before a tournament create/join.
    ///
    /// Returns the identifier known until now.
    pub fn begin_tournament_request(&mut self) -> Option<String> {
        self.in_tournament = true;
        self.tournament_end = None;
        self.tournament_id.send_replace(None)
    }

    /// Record confirmed tournament membership.
    pub fn set_tournament(&mut self, tournament: Tournament) {
        self.in_tournament = true;
        self.tournament_id.send_replace(Some(tournament.id.clone()));
        self.tournament = Some(tournament);
    }

    /// Apply a `tournament_end` notice.
    pub fn apply_tournament_end(&mut self, summary: String) {
        info!("Tournament ended: {}", summary);
        self.in_tournament = false;
        self.tournament = None;
        self.tournament_id.send_replace(None);
        self.tournament_end = Some(summary);
    }

    /// Leave the tournament.
    pub fn clear_tournament(&mut self) {
        self.in_tournament = false;
        self.tournament = None;
        self.tournament_end = None;
        self.tournament_id.send_replace(None);
    }

    /// Tournament membership.
    pub fn tournament(&self) -> Option<Tournament> {
        self.tournament.clone()
    }

    /// Tournament identifier.
    pub fn tournament_id(&self) -> Option<String> {
        self.tournament_id.borrow().clone()
    }

    /// Whether a tournament is pending or running.
    pub fn in_tournament(&self) -> bool {
        self.in_tournament
    }

    /// Take the end-of-tournament summary. Returns it exactly once.
    pub fn take_tournament_end(&mut self) -> Option<String> {
        self.tournament_end.take()
    }

    /// Observe the tournament identifier.
    pub fn subscribe_tournament_id(&self) -> watch::Receiver<Option<String>> {
        self.tournament_id.subscribe()
    }

    fn remember_finished(&mut self, id: String) {
        if self.finished.contains(&id) {
            return;
        }
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(id);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Paddle, PlayerScore, Point};
    use proptest::prelude::*;

    fn snapshot(id: &str, status: MatchStatus, ball_x: f64) -> Match {
        Match {
            id: id.to_string(),
            status,
            ball: Point::new(ball_x, 0.5),
            left_paddle: Paddle::LEFT,
            right_paddle: Paddle::RIGHT,
            scores: vec![
                PlayerScore { alias: Some("l".into()), score: 1 },
                PlayerScore { alias: Some("r".into()), score: 2 },
            ],
            countdown: None,
            last_update_time: 1,
            game_mode: None,
            max_score: Some(10),
        }
    }

    #[test]
    fn test_first_update_binds_identifier() {
        let mut r = MatchReconciler::new();
        assert_eq!(r.apply_state(snapshot("g1", MatchStatus::Playing, 0.1)), ApplyOutcome::Applied);
        assert_eq!(r.tracked_id().as_deref(), Some("g1"));
        assert_eq!(r.current_match().unwrap().ball.x, 0.1);
    }

    #[test]
    fn test_foreign_update_ignored() {
        let mut r = MatchReconciler::new();
        r.apply_state(snapshot("g1", MatchStatus::Playing, 0.1));
        let before = r.current_match();

        assert_eq!(
            r.apply_state(snapshot("g2", MatchStatus::Playing, 0.9)),
            ApplyOutcome::IgnoredForeign
        );
        assert_eq!(r.current_match(), before);
        assert_eq!(r.tracked_id().as_deref(), Some("g1"));
    }

    #[test]
    fn test_finished_update_ignored() {
        let mut r = MatchReconciler::new();
        r.apply_state(snapshot("g1", MatchStatus::Playing, 0.1));
        let before = r.current_match();

        assert_eq!(
            r.apply_state(snapshot("g1", MatchStatus::Finished, 0.7)),
            ApplyOutcome::IgnoredFinished
        );
        // Later non-finished frames for the same match stay ignored.
        assert_eq!(
            r.apply_state(snapshot("g1", MatchStatus::Playing, 0.8)),
            ApplyOutcome::IgnoredFinished
        );
        assert_eq!(r.current_match(), before);
    }

    #[test]
    fn test_finished_history_is_bounded() {
        let mut r = MatchReconciler::new();
        for i in 0..FINISHED_HISTORY * 3 {
            r.apply_state(snapshot(&format!("g{}", i), MatchStatus::Finished, 0.5));
            r.apply_state(snapshot(&format!("g{}", i), MatchStatus::Finished, 0.5));
        }
        assert_eq!(r.finished.len(), FINISHED_HISTORY);

        // The most recent ones stay terminal.
        let last = format!("g{}", FINISHED_HISTORY * 3 - 1);
        assert_eq!(r.apply_state(snapshot(&last, MatchStatus::Playing, 0.5)), ApplyOutcome::IgnoredFinished);
    }

    #[test]
    fn test_duplicate_frame_yields_identical_snapshot() {
        let mut r = MatchReconciler::new();
        let frame = snapshot("g1", MatchStatus::Playing, 0.33);
        r.apply_state(frame.clone());
        let first = r.current_match();
        r.apply_state(frame);
        assert_eq!(r.current_match(), first);
    }

    #[test]
    fn test_game_over_clears_and_reads_once() {
        let mut r = MatchReconciler::new();
        r.apply_state(snapshot("g1", MatchStatus::Playing, 0.1));
        r.apply_game_over(GameOver { game_id: Some("g1".into()), ..Default::default() });

        assert!(r.tracked_id().is_none());
        assert!(r.current_match().is_none());
        assert!(r.has_game_over());
        assert_eq!(r.take_game_over().unwrap().game_id.as_deref(), Some("g1"));
        assert!(r.take_game_over().is_none());
    }

    #[test]
    fn test_created_binds_match_then_accepts_its_updates() {
        let mut r = MatchReconciler::new();
        r.bind_created("alice-Game-5".into());
        assert_eq!(r.tracked_id().as_deref(), Some("alice-Game-5"));
        assert_eq!(
            r.apply_state(snapshot("other", MatchStatus::Waiting, 0.5)),
            ApplyOutcome::IgnoredForeign
        );
        assert_eq!(
            r.apply_state(snapshot("alice-Game-5", MatchStatus::Countdown, 0.5)),
            ApplyOutcome::Applied
        );
        r.apply_countdown(3);
        assert_eq!(r.current_match().unwrap().countdown, Some(3));
        assert_eq!(r.countdown(), Some(3));
    }

    #[test]
    fn test_created_routes_tournament_ids() {
        let mut r = MatchReconciler::new();
        r.bind_created("bob-Tournament-1".into());
        assert_eq!(r.tournament_id().as_deref(), Some("bob-Tournament-1"));
        assert!(r.tracked_id().is_none());

        // While a tournament request is pending every confirmation is the tournament's.
        r.clear_tournament();
        r.begin_tournament_request();
        r.bind_created("t-42".into());
        assert_eq!(r.tournament_id().as_deref(), Some("t-42"));
        assert!(r.tracked_id().is_none());
    }

    #[test]
    fn test_begin_match_request_returns_prior() {
        let mut r = MatchReconciler::new();
        r.bind_created("g1".into());
        let mut rx = r.subscribe_match_id();
        assert_eq!(r.begin_match_request().as_deref(), Some("g1"));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
    }

    #[test]
    fn test_tournament_end_clears_membership() {
        let mut r = MatchReconciler::new();
        r.set_tournament(Tournament::new("t1", "bob", "B"));
        assert!(r.in_tournament());

        r.apply_tournament_end("Winner: bob".into());
        assert!(!r.in_tournament());
        assert!(r.tournament().is_none());
        assert_eq!(r.take_tournament_end().as_deref(), Some("Winner: bob"));
        assert!(r.take_tournament_end().is_none());
    }

    #[test]
    fn test_tournament_match_coexists_with_membership() {
        let mut r = MatchReconciler::new();
        r.set_tournament(Tournament::new("t1", "bob", "B"));
        r.apply_state(snapshot("t1-match-1", MatchStatus::Playing, 0.5));
        assert_eq!(r.tracked_id().as_deref(), Some("t1-match-1"));
        assert_eq!(r.tournament_id().as_deref(), Some("t1"));
    }

    fn status_strategy() -> impl Strategy<Value = MatchStatus> {
        prop_oneof![
            Just(MatchStatus::Waiting),
            Just(MatchStatus::Countdown),
            Just(MatchStatus::Playing),
            Just(MatchStatus::Paused),
            Just(MatchStatus::Finished),
        ]
    }

    proptest! {
        #[test]
        fn prop_finality_is_terminal(
            updates in prop::collection::vec((status_strategy(), 0.0f64..1.0), 1..30)
        ) {
            let mut r = MatchReconciler::new();
            r.apply_state(snapshot("g1", MatchStatus::Playing, 0.5));
            r.apply_state(snapshot("g1", MatchStatus::Finished, 0.5));
            let frozen = r.current_match();

            for (status, x) in updates {
                r.apply_state(snapshot("g1", status, x));
                prop_assert_eq!(r.current_match(), frozen.clone());
            }
        }

        #[test]
        fn prop_foreign_ids_never_change_state(
            updates in prop::collection::vec(("[a-z]{1,6}", status_strategy(), 0.0f64..1.0), 1..30)
        ) {
            let mut r = MatchReconciler::new();
            r.apply_state(snapshot("tracked", MatchStatus::Playing, 0.5));
            let before = r.current_match();

            for (id, status, x) in updates {
                prop_assume!(id != "tracked");
                r.apply_state(snapshot(&id, status, x));
                prop_assert_eq!(r.current_match(), before.clone());
                prop_assert_eq!(r.tracked_id(), Some("tracked".to_string()));
            }
        }
    }
}
