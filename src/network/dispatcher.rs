//! Message Dispatcher
//!
//! Decodes inbound frames and routes them by kind. Foreign and malformed
//! frames are dropped and logged; only server-reported errors reach the UI,
//! through a single-slot [`FaultSlot`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::game::reconciler::MatchReconciler;
use crate::game::state::GameListing;
use crate::network::protocol::{decode_frame, DecodeError, ServerEvent};
use crate::network::transport::TransportError;

/// Most frames kept while debug capture is on; older ones are dropped.
pub const DEBUG_CAPTURE_LIMIT: usize = 256;

// =============================================================================
// FAULTS
// =============================================================================

/// Advisory error for the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Human-readable message.
    pub message: String,
    /// Server error code, or a local one for client-side timeouts.
    pub code: i64,
}

impl Fault {
    /// Create a fault.
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        Self { message: message.into(), code }
    }
}

/// Holds at most one unread fault. A new fault replaces an unread one.
#[derive(Debug, Default)]
pub struct FaultSlot {
    slot: Mutex<Option<Fault>>,
}

impl FaultSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fault, replacing any unread one.
    pub fn raise(&self, fault: Fault) {
        warn!("Fault {}: {}", fault.code, fault.message);
        *self.lock() = Some(fault);
    }

    /// Take the unread fault, leaving the slot empty.
    pub fn take(&self) -> Option<Fault> {
        self.lock().take()
    }

    /// Whether a fault is waiting.
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Fault>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Receiving ends of the joinable-list snapshots.
pub struct ListReceivers {
    /// `game_list` snapshots.
    pub games: mpsc::UnboundedReceiver<Vec<GameListing>>,
    /// `tournament_list` snapshots.
    pub tournaments: mpsc::UnboundedReceiver<Vec<GameListing>>,
}

/// Routes decoded frames; sole writer of the reconciler.
pub struct MessageDispatcher {
    reconciler: Arc<RwLock<MatchReconciler>>,
    faults: Arc<FaultSlot>,
    game_lists: mpsc::UnboundedSender<Vec<GameListing>>,
    tournament_lists: mpsc::UnboundedSender<Vec<GameListing>>,
    capture: AtomicBool,
    captured: Mutex<VecDeque<String>>,
}

impl MessageDispatcher {
    /// Create a dispatcher writing into `reconciler` and `faults`.
    pub fn new(reconciler: Arc<RwLock<MatchReconciler>>, faults: Arc<FaultSlot>) -> (Self, ListReceivers) {
        let (game_lists, games) = mpsc::unbounded_channel();
        let (tournament_lists, tournaments) = mpsc::unbounded_channel();
        let dispatcher = Self {
            reconciler,
            faults,
            game_lists,
            tournament_lists,
            capture: AtomicBool::new(false),
            captured: Mutex::new(VecDeque::new()),
        };
        (dispatcher, ListReceivers { games, tournaments })
    }

    /// Decode and route one text frame.
    ///
    /// Returns the kind routed, or `None` when the frame was dropped or captured.
    pub async fn dispatch(&self, text: &str) -> Option<&'static str> {
        let event = match decode_frame(text) {
            Ok(event) => event,
            Err(DecodeError::ForeignNamespace(target)) => {
                debug!("Dropping frame for {:?}", target);
                return None;
            }
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return None;
            }
        };

        if self.capture.load(Ordering::Acquire) {
            let mut captured = self.lock_captured();
            if captured.len() >= DEBUG_CAPTURE_LIMIT {
                captured.pop_front();
            }
            captured.push_back(text.to_string());
            return None;
        }

        let kind = event.kind();
        match event {
            ServerEvent::Error { pong_data } => {
                self.faults.raise(Fault::new(pong_data.message, pong_data.code));
            }
            ServerEvent::GameList { games } => {
                let _ = self.game_lists.send(games);
            }
            ServerEvent::TournamentList { games } => {
                let _ = self.tournament_lists.send(games);
            }
            ServerEvent::GameState { game } => {
                let outcome = self.reconciler.write().await.apply_state(game);
                debug!("game_state: {:?}", outcome);
            }
            ServerEvent::GameCreated { game_id } => {
                self.reconciler.write().await.bind_created(game_id);
            }
            ServerEvent::GameOver { pong_data } => {
                self.reconciler.write().await.apply_game_over(pong_data);
            }
            ServerEvent::TournamentEnd { value } => {
                self.reconciler.write().await.apply_tournament_end(value);
            }
            ServerEvent::Countdown { value } => {
                self.reconciler.write().await.apply_countdown(value);
            }
            ServerEvent::Unknown => {
                debug!("Ignoring unknown message kind");
                return None;
            }
        }
        Some(kind)
    }

    /// Consume inbound frames until the transport goes away.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<String>) -> Result<(), TransportError> {
        while let Some(text) = inbound.recv().await {
            self.dispatch(&text).await;
        }
        info!("Inbound stream ended");
        Err(TransportError::Closed)
    }

    /// Buffer frames verbatim instead of routing them.
    pub fn enable_debug_capture(&self) {
        info!("Debug capture enabled");
        self.capture.store(true, Ordering::Release);
    }

    /// Resume normal routing. Captured frames stay until drained.
    pub fn disable_debug_capture(&self) {
        info!("Debug capture disabled");
        self.capture.store(false, Ordering::Release);
    }

    /// Whether debug capture is on.
    pub fn debug_capture_enabled(&self) -> bool {
        self.capture.load(Ordering::Acquire)
    }

    /// Take every captured frame, oldest first.
    pub fn drain_debug_frames(&self) -> Vec<String> {
        self.lock_captured().drain(..).collect()
    }

    fn lock_captured(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.captured.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (MessageDispatcher, ListReceivers, Arc<RwLock<MatchReconciler>>, Arc<FaultSlot>) {
        let reconciler = Arc::new(RwLock::new(MatchReconciler::new()));
        let faults = Arc::new(FaultSlot::new());
        let (dispatcher, lists) = MessageDispatcher::new(reconciler.clone(), faults.clone());
        (dispatcher, lists, reconciler, faults)
    }

    fn state_frame(id: &str, status: &str, ball_x: f64) -> String {
        json!({
            "target_endpoint": "pong-api",
            "type": "game_state",
            "game": {
                "id": id,
                "status": status,
                "ball": { "x": ball_x, "y": 0.5 },
                "leftPaddle": { "topPoint": { "x": 0, "y": 0.4 }, "height": 0.2 },
                "rightPaddle": { "topPoint": { "x": 0.99, "y": 0.4 }, "height": 0.2 },
                "scores": [{ "alias": "l", "score": 0 }, { "alias": "r", "score": 1 }],
                "lastUpdateTime": 1700000000000i64
            }
        })
        .to_string()
    }

    #[test]
    fn test_fault_slot_last_wins_and_reads_once() {
        let slot = FaultSlot::new();
        slot.raise(Fault::new("first", 1));
        slot.raise(Fault::new("second", 2));
        assert!(slot.is_set());
        assert_eq!(slot.take(), Some(Fault::new("second", 2)));
        assert_eq!(slot.take(), None);
    }

    #[tokio::test]
    async fn test_error_frame_raises_fault() {
        let (dispatcher, _lists, _reconciler, faults) = setup();
        let frame = json!({
            "target_endpoint": "pong-api",
            "type": "error",
            "pong_data": { "message": "Game is full", "code": 4001 }
        });
        assert_eq!(dispatcher.dispatch(&frame.to_string()).await, Some("error"));
        assert_eq!(faults.take(), Some(Fault::new("Game is full", 4001)));
    }

    #[tokio::test]
    async fn test_game_state_reaches_reconciler() {
        let (dispatcher, _lists, reconciler, _faults) = setup();
        dispatcher.dispatch(&state_frame("g1", "playing", 0.25)).await;
        let current = reconciler.read().await.current_match().unwrap();
        assert_eq!(current.id, "g1");
        assert_eq!(current.ball.x, 0.25);
        assert_eq!(current.right_score(), 1);
    }

    #[tokio::test]
    async fn test_foreign_frame_changes_nothing() {
        let (dispatcher, mut lists, reconciler, faults) = setup();
        let foreign = json!({
            "target_endpoint": "chat-api",
            "type": "game_created",
            "gameId": "g1"
        });
        assert_eq!(dispatcher.dispatch(&foreign.to_string()).await, None);
        assert_eq!(dispatcher.dispatch("{not json").await, None);

        let r = reconciler.read().await;
        assert!(r.tracked_id().is_none());
        assert!(r.current_match().is_none());
        assert!(!faults.is_set());
        assert!(lists.games.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_created_over_countdown_and_tournament_end() {
        let (dispatcher, _lists, reconciler, _faults) = setup();
        let created = json!({ "target_endpoint": "pong-api", "type": "game_created", "gameId": "g7" });
        dispatcher.dispatch(&created.to_string()).await;
        assert_eq!(reconciler.read().await.tracked_id().as_deref(), Some("g7"));

        let countdown = json!({ "target_endpoint": "pong-api", "type": "countdown", "value": 2 });
        dispatcher.dispatch(&countdown.to_string()).await;
        assert_eq!(reconciler.read().await.countdown(), Some(2));

        let over = json!({ "target_endpoint": "pong-api", "type": "game_over", "pong_data": { "gameId": "g7" } });
        dispatcher.dispatch(&over.to_string()).await;
        {
            let mut r = reconciler.write().await;
            assert!(r.tracked_id().is_none());
            assert!(r.take_game_over().is_some());
            assert!(r.take_game_over().is_none());
        }

        let end = json!({ "target_endpoint": "pong-api", "type": "tournament_end", "value": "Winner: bob" });
        dispatcher.dispatch(&end.to_string()).await;
        assert_eq!(reconciler.write().await.take_tournament_end().as_deref(), Some("Winner: bob"));
    }

    #[tokio::test]
    async fn test_lists_are_forwarded() {
        let (dispatcher, mut lists, _reconciler, _faults) = setup();
        let games = json!({
            "target_endpoint": "pong-api",
            "type": "game_list",
            "games": [{ "id": "g1", "owner": "bob", "alias": "B", "state": "waiting" }]
        });
        let tournaments = json!({ "target_endpoint": "pong-api", "type": "tournament_list", "games": [] });
        dispatcher.dispatch(&games.to_string()).await;
        dispatcher.dispatch(&tournaments.to_string()).await;

        assert_eq!(lists.games.try_recv().unwrap()[0].id, "g1");
        assert!(lists.tournaments.try_recv().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_ignored() {
        let (dispatcher, _lists, reconciler, faults) = setup();
        let frame = json!({ "target_endpoint": "pong-api", "type": "chat", "text": "hi" });
        assert_eq!(dispatcher.dispatch(&frame.to_string()).await, None);
        assert!(reconciler.read().await.current_match().is_none());
        assert!(!faults.is_set());
    }

    #[tokio::test]
    async fn test_debug_capture_suspends_routing() {
        let (dispatcher, _lists, reconciler, _faults) = setup();
        dispatcher.enable_debug_capture();
        assert!(dispatcher.debug_capture_enabled());

        let frame = state_frame("g1", "playing", 0.5);
        assert_eq!(dispatcher.dispatch(&frame).await, None);
        dispatcher.dispatch("garbage").await;
        assert!(reconciler.read().await.current_match().is_none());
        assert_eq!(dispatcher.drain_debug_frames(), vec![frame.clone()]);
        assert!(dispatcher.drain_debug_frames().is_empty());

        dispatcher.disable_debug_capture();
        assert_eq!(dispatcher.dispatch(&frame).await, Some("game_state"));
        assert!(reconciler.read().await.current_match().is_some());
    }

    #[tokio::test]
    async fn test_run_ends_with_inbound_stream() {
        let (dispatcher, _lists, reconciler, _faults) = setup();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(state_frame("g1", "countdown", 0.5)).unwrap();
        drop(tx);

        assert!(matches!(dispatcher.run(rx).await, Err(TransportError::Closed)));
        assert_eq!(reconciler.read().await.tracked_id().as_deref(), Some("g1"));
    }
}
