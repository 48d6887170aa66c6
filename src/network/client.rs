//! Game Client
//!
//! Game-aware facade over the session: composes the authenticator, the
//! outbound queue, the dispatcher and the reconciler, and exposes the
//! polling/command surface the render layer drives.
//!
//! Create/join confirmation has no request id to correlate on (the server
//! does not echo one). Instead each request resets the tracked identifier,
//! then waits on its change notification until a new identifier is bound or
//! the confirmation timeout expires.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, instrument, warn};

use crate::config::ClientConfig;
use crate::game::input::{Direction, InputState, InputThrottler};
use crate::game::reconciler::MatchReconciler;
use crate::game::state::{GameListing, GameOver, Match, Tournament, TournamentPlayer};
use crate::network::auth::{AuthClient, AuthError, Credentials};
use crate::network::dispatcher::{Fault, FaultSlot, MessageDispatcher};
use crate::network::protocol::ClientRequest;
use crate::network::transport::{Outbox, OutboxReceiver, TransportError};

/// Fault code reported when a joinable list does not arrive in time.
pub const LIST_TIMEOUT_CODE: i64 = 420;

/// Session client used by the render/menu layer.
pub struct GameClient {
    config: ClientConfig,
    auth: Arc<AuthClient>,
    reconciler: Arc<RwLock<MatchReconciler>>,
    faults: Arc<FaultSlot>,
    dispatcher: Arc<MessageDispatcher>,
    outbox: Outbox,
    outbound: Mutex<Option<OutboxReceiver>>,
    throttler: InputThrottler,
    game_lists: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<GameListing>>>,
    tournament_lists: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<GameListing>>>,
    known_tournaments: Mutex<Vec<GameListing>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<Option<String>>,
}

impl GameClient {
    /// Create a client. Nothing touches the network until the session runs.
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self, AuthError> {
        let auth = Arc::new(AuthClient::new(config.clone(), credentials)?);
        let reconciler = Arc::new(RwLock::new(MatchReconciler::new()));
        let faults = Arc::new(FaultSlot::new());
        let (dispatcher, lists) = MessageDispatcher::new(reconciler.clone(), faults.clone());
        let (outbox, outbound) = Outbox::channel();
        let throttler = InputThrottler::new(outbox.clone(), &config);
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(None);

        Ok(Self {
            config,
            auth,
            reconciler,
            faults,
            dispatcher: Arc::new(dispatcher),
            outbox,
            outbound: Mutex::new(Some(outbound)),
            throttler,
            game_lists: tokio::sync::Mutex::new(lists.games),
            tournament_lists: tokio::sync::Mutex::new(lists.tournaments),
            known_tournaments: Mutex::new(Vec::new()),
            connected,
            shutdown,
        })
    }

    // =========================================================================
    // COMPONENTS
    // =========================================================================

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Session manager.
    pub fn auth(&self) -> &Arc<AuthClient> {
        &self.auth
    }

    /// Frame dispatcher.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Outbound queue handle.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Hand the outbound queue's receiving end to the send loop. Yields it once.
    pub(crate) fn take_outbound(&self) -> Option<OutboxReceiver> {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    // =========================================================================
    // POLLING
    // =========================================================================

    /// Snapshot of the tracked match.
    pub async fn current_match(&self) -> Option<Match> {
        self.reconciler.read().await.current_match()
    }

    /// Whether the socket is up.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolve once the socket is up.
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.subscribe();
        let _ = rx.wait_for(|up| *up).await.map(|_| ());
    }

    pub(crate) fn set_connected(&self, up: bool) {
        self.connected.send_replace(up);
    }

    /// Take the unread fault.
    pub fn current_fault(&self) -> Option<Fault> {
        self.faults.take()
    }

    /// Tournament membership.
    pub async fn current_tournament(&self) -> Option<Tournament> {
        self.reconciler.read().await.tournament()
    }

    /// Take the last `game_over` payload.
    pub async fn take_game_over(&self) -> Option<GameOver> {
        self.reconciler.write().await.take_game_over()
    }

    /// Take the last tournament summary.
    pub async fn take_tournament_end(&self) -> Option<String> {
        self.reconciler.write().await.take_tournament_end()
    }

    /// Last countdown value.
    pub async fn countdown(&self) -> Option<u32> {
        self.reconciler.read().await.countdown()
    }

    // =========================================================================
    // MATCHES
    // =========================================================================

    /// Ask the server to create a remote match.
    pub async fn create_match(&self, alias: &str) -> Result<(), TransportError> {
        self.reconciler.write().await.begin_match_request();
        self.outbox.send(&ClientRequest::create_game(alias))
    }

    /// Create a match and wait for its confirmation.
    ///
    /// Returns a placeholder snapshot once an identifier is bound, or `None`
    /// when the server stays silent past the confirmation timeout.
    #[instrument(skip(self))]
    pub async fn create_and_wait_for_match(
        &self,
        alias: &str,
        max_score: Option<u32>,
    ) -> Result<Option<Match>, TransportError> {
        let (prior, rx) = self.begin_match_request().await;
        self.outbox.send(&ClientRequest::create_game(alias))?;
        Ok(self.await_match(prior, rx, max_score).await)
    }

    /// Ask the server to join a waiting match.
    pub async fn join_match(&self, game_id: &str, alias: &str) -> Result<(), TransportError> {
        self.reconciler.write().await.begin_match_request();
        self.outbox.send(&ClientRequest::join_game(self.auth.username(), alias, game_id))
    }

    /// Join a match and wait for its confirmation.
    #[instrument(skip(self))]
    pub async fn join_match_and_wait(&self, game_id: &str, alias: &str) -> Result<Option<Match>, TransportError> {
        let (prior, rx) = self.begin_match_request().await;
        self.outbox.send(&ClientRequest::join_game(self.auth.username(), alias, game_id))?;
        Ok(self.await_match(prior, rx, None).await)
    }

    /// Abandon the current match.
    pub async fn clear_match(&self) {
        self.reconciler.write().await.clear_match();
    }

    async fn begin_match_request(&self) -> (Option<String>, watch::Receiver<Option<String>>) {
        let mut reconciler = self.reconciler.write().await;
        let prior = reconciler.begin_match_request();
        (prior, reconciler.subscribe_match_id())
    }

    async fn await_match(
        &self,
        prior: Option<String>,
        rx: watch::Receiver<Option<String>>,
        max_score: Option<u32>,
    ) -> Option<Match> {
        match self.await_new_id(prior, rx).await {
            Some(id) => {
                info!("Match confirmed: {}", id);
                Some(self.current_match().await.unwrap_or_else(|| Match::placeholder(id, max_score)))
            }
            None => {
                warn!("No match confirmation within {:?}", self.config.confirm_timeout);
                None
            }
        }
    }

    /// Wait until the identifier is bound to a value other than `prior`.
    async fn await_new_id(
        &self,
        prior: Option<String>,
        mut rx: watch::Receiver<Option<String>>,
    ) -> Option<String> {
        let changed = tokio::time::timeout(self.config.confirm_timeout, async {
            rx.wait_for(|id| id.is_some() && *id != prior).await.map(|id| id.clone())
        })
        .await;
        match changed {
            Ok(Ok(id)) => id,
            _ => None,
        }
    }

    // =========================================================================
    // TOURNAMENTS
    // =========================================================================

    /// Ask the server to create a tournament.
    pub async fn create_tournament(&self, alias: &str) -> Result<(), TransportError> {
        self.reconciler.write().await.begin_tournament_request();
        self.outbox.send(&ClientRequest::create_tournament(alias))
    }

    /// Create a tournament and wait for its confirmation.
    #[instrument(skip(self))]
    pub async fn create_and_wait_for_tournament(&self, alias: &str) -> Result<Option<Tournament>, TransportError> {
        let (prior, rx) = self.begin_tournament_request().await;
        self.outbox.send(&ClientRequest::create_tournament(alias))?;
        let username = self.auth.username();
        let template = Tournament::new(String::new(), username.clone(), alias);
        Ok(self.await_tournament(prior, rx, template, username, alias).await)
    }

    /// Ask the server to join a tournament.
    pub async fn join_tournament(&self, tournament_id: &str, alias: &str) -> Result<(), TransportError> {
        self.reconciler.write().await.begin_tournament_request();
        self.outbox.send(&ClientRequest::join_tournament(alias, tournament_id))
    }

    /// Join a tournament and wait for its confirmation.
    #[instrument(skip(self))]
    pub async fn join_tournament_and_wait(
        &self,
        tournament_id: &str,
        alias: &str,
    ) -> Result<Option<Tournament>, TransportError> {
        let (prior, rx) = self.begin_tournament_request().await;
        self.outbox.send(&ClientRequest::join_tournament(alias, tournament_id))?;
        let template = self
            .known_tournaments
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|listing| listing.id == tournament_id)
            .map(Tournament::from_listing)
            .unwrap_or_else(|| Tournament::new(tournament_id, String::new(), String::new()));
        Ok(self.await_tournament(prior, rx, template, self.auth.username(), alias).await)
    }

    /// Leave the tournament.
    pub async fn clear_tournament(&self) {
        self.reconciler.write().await.clear_tournament();
    }

    async fn begin_tournament_request(&self) -> (Option<String>, watch::Receiver<Option<String>>) {
        let mut reconciler = self.reconciler.write().await;
        let prior = reconciler.begin_tournament_request();
        (prior, reconciler.subscribe_tournament_id())
    }

    async fn await_tournament(
        &self,
        prior: Option<String>,
        rx: watch::Receiver<Option<String>>,
        template: Tournament,
        player: String,
        alias: &str,
    ) -> Option<Tournament> {
        let Some(id) = self.await_new_id(prior, rx).await else {
            warn!("No tournament confirmation within {:?}", self.config.confirm_timeout);
            self.reconciler.write().await.clear_tournament();
            return None;
        };

        info!("Tournament confirmed: {}", id);
        let mut tournament = Tournament { id, ..template };
        tournament.players.push(TournamentPlayer { name: player, alias: alias.to_string() });
        self.reconciler.write().await.set_tournament(tournament.clone());
        Some(tournament)
    }

    // =========================================================================
    // LOBBY
    // =========================================================================

    /// Joinable games. Empty (with a fault raised) when no list arrives in time.
    pub async fn joinable_games(&self) -> Result<Vec<GameListing>, TransportError> {
        self.joinable(&self.game_lists, ClientRequest::GameList {}, "games").await
    }

    /// Joinable tournaments. Empty (with a fault raised) when no list arrives in time.
    pub async fn joinable_tournaments(&self) -> Result<Vec<GameListing>, TransportError> {
        let listings =
            self.joinable(&self.tournament_lists, ClientRequest::TournamentList {}, "tournaments").await?;
        *self.known_tournaments.lock().unwrap_or_else(|p| p.into_inner()) = listings.clone();
        Ok(listings)
    }

    async fn joinable(
        &self,
        lists: &tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<GameListing>>>,
        request: ClientRequest,
        what: &str,
    ) -> Result<Vec<GameListing>, TransportError> {
        let mut lists = lists.lock().await;
        while lists.try_recv().is_ok() {}

        self.outbox.send(&request)?;
        match tokio::time::timeout(self.config.list_timeout, lists.recv()).await {
            Ok(Some(listings)) => Ok(listings.into_iter().filter(GameListing::is_joinable).collect()),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => {
                self.faults.raise(Fault::new(format!("Timed out waiting for {}", what), LIST_TIMEOUT_CODE));
                Ok(Vec::new())
            }
        }
    }

    // =========================================================================
    // INPUT
    // =========================================================================

    /// Set a pressed flag.
    pub fn set_input_pressed(&self, direction: Direction, pressed: bool) {
        self.throttler.set_pressed(direction, pressed);
    }

    /// Press one direction, releasing the other.
    pub fn press(&self, direction: Direction) {
        self.throttler.press(direction);
    }

    /// Current key state.
    pub fn input_state(&self) -> InputState {
        self.throttler.snapshot()
    }

    /// Start streaming intent for the signed-in user.
    pub async fn start_continuous_input(&self) {
        self.throttler.start(self.auth.username()).await;
    }

    /// Stop streaming intent and release every key.
    pub async fn stop_continuous_input(&self) {
        self.throttler.stop().await;
    }

    // =========================================================================
    // DIAGNOSTICS & SHUTDOWN
    // =========================================================================

    /// Buffer inbound frames instead of routing them.
    pub fn enable_debug_capture(&self) {
        self.dispatcher.enable_debug_capture();
    }

    /// Resume routing inbound frames.
    pub fn disable_debug_capture(&self) {
        self.dispatcher.disable_debug_capture();
    }

    /// Take every captured frame.
    pub fn drain_debug_frames(&self) -> Vec<String> {
        self.dispatcher.drain_debug_frames()
    }

    /// Enqueue a verbatim frame.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbox.send_raw(text)
    }

    /// Ask the running session to exit gracefully.
    pub fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!("Shutdown requested: {}", reason);
        self.shutdown.send_replace(Some(reason));
    }

    /// Observe shutdown requests.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<Option<String>> {
        self.shutdown.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn reconciler(&self) -> &Arc<RwLock<MatchReconciler>> {
        &self.reconciler
    }
}

/// Wait for a non-empty value on a shutdown channel.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<Option<String>>) -> String {
    let requested = rx.wait_for(Option::is_some).await.map(|reason| reason.clone().unwrap_or_default());
    match requested {
        Ok(reason) => reason,
        Err(_) => std::future::pending().await,
    }
}

impl std::fmt::Debug for GameClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameClient")
            .field("backend_url", &self.config.backend_url)
            .finish_non_exhaustive()
    }
}
