//! Session Orchestration
//!
//! Runs the session's long-lived activities side by side: token
//! revalidation, the socket's receive and send loops, and frame
//! consumption. None of them is expected to return; the first one that does
//! (cleanly or with an error) ends the session and every other activity is
//! aborted with it. A shutdown request ends the session gracefully.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::network::auth::AuthError;
use crate::network::client::{shutdown_requested, GameClient};
use crate::network::transport::{self, TransportError};

/// Fatal session errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Login, 2FA or refresh failed.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Socket failed or closed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The backend no longer accepts the access token.
    #[error("Session expired")]
    SessionExpired,

    /// Login did not complete in time.
    #[error("Login timed out after {0:?}")]
    LoginTimeout(Duration),

    /// An activity returned although it should run for the whole session.
    #[error("Activity exited: {0}")]
    ActivityExited(&'static str),

    /// An activity panicked.
    #[error("Activity failed: {0}")]
    ActivityFailed(String),

    /// The session was already started on this client.
    #[error("Session already running")]
    AlreadyRunning,
}

/// Why a session ended without error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Deliberate shutdown.
    Graceful {
        /// Reason given to [`GameClient::shutdown`].
        reason: String,
    },
}

type Activity = (&'static str, Result<(), ClientError>);

/// Log in, then run every session activity until one of them ends or a
/// shutdown is requested.
///
/// Login (2FA prompt included) is bounded by `login_timeout`.
#[instrument(skip(client))]
pub async fn run(client: Arc<GameClient>, login_timeout: Duration) -> Result<ExitReason, ClientError> {
    let outbound = client.take_outbound().ok_or(ClientError::AlreadyRunning)?;
    let mut shutdown_rx = client.subscribe_shutdown();

    tokio::select! {
        login = tokio::time::timeout(login_timeout, client.auth().login()) => {
            match login {
                Ok(session) => {
                    let session = session?;
                    info!("Signed in as {}", session.user.username);
                }
                Err(_) => {
                    error!("Login timed out after {:?}", login_timeout);
                    client.auth().terminate();
                    return Err(ClientError::LoginTimeout(login_timeout));
                }
            }
        }
        reason = shutdown_requested(&mut shutdown_rx) => {
            client.auth().terminate();
            return Ok(ExitReason::Graceful { reason });
        }
    }

    let mut activities = spawn_activities(&client, outbound);

    let outcome = tokio::select! {
        Some(joined) = activities.join_next() => match joined {
            Ok((name, Ok(()))) => {
                warn!("{} exited", name);
                Err(ClientError::ActivityExited(name))
            }
            Ok((name, Err(e))) => {
                error!("{} failed: {}", name, e);
                Err(e)
            }
            Err(e) => Err(ClientError::ActivityFailed(e.to_string())),
        },
        reason = shutdown_requested(&mut shutdown_rx) => {
            info!("Graceful exit: {}", reason);
            Ok(ExitReason::Graceful { reason })
        }
    };

    activities.abort_all();
    while activities.join_next().await.is_some() {}
    client.set_connected(false);
    client.stop_continuous_input().await;
    client.auth().terminate();
    info!("Session ended");

    outcome
}

fn spawn_activities(client: &Arc<GameClient>, outbound: transport::OutboxReceiver) -> JoinSet<Activity> {
    let mut activities = JoinSet::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sink_tx, sink_rx) = oneshot::channel();

    let c = client.clone();
    activities.spawn(async move { ("revalidate", revalidate_loop(&c).await) });

    let c = client.clone();
    activities.spawn(async move {
        let result = async {
            let token = c.auth().wait_for_token().await;
            let (sink, source) = transport::connect(c.config(), &token).await?;
            let _ = sink_tx.send(sink);
            c.set_connected(true);
            transport::receive_loop(source, c.outbox().clone(), inbound_tx).await?;
            Ok::<(), ClientError>(())
        }
        .await;
        ("receive", result)
    });

    activities.spawn(async move {
        let result = async {
            let sink = sink_rx.await.map_err(|_| TransportError::Closed)?;
            transport::send_loop(sink, outbound).await?;
            Ok::<(), ClientError>(())
        }
        .await;
        ("send", result)
    });

    let c = client.clone();
    activities.spawn(async move {
        let result = c.dispatcher().run(inbound_rx).await.map_err(ClientError::from);
        ("consume", result)
    });

    activities
}

async fn revalidate_loop(client: &GameClient) -> Result<(), ClientError> {
    let mut ticker = interval(client.config().revalidate_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !client.auth().revalidate().await? {
            error!("Access token rejected");
            return Err(ClientError::SessionExpired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::network::auth::{AuthPhase, Credentials};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_backend(sign_in: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sign-in"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sign_in))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/ws-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errorMessage": "", "token": "tok-1" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/validate-access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "isAccessTokenValid": true })))
            .mount(&server)
            .await;
        server
    }

    fn signed_in() -> serde_json::Value {
        json!({ "errorMessage": "", "user": { "id": "1", "username": "alice", "isSignedIn": true } })
    }

    fn make_client(backend: &MockServer, socket: Option<String>, tweak: impl FnOnce(&mut ClientConfig)) -> Arc<GameClient> {
        let mut config = ClientConfig::default().with_backend_url(backend.uri());
        config.socket_url = socket;
        tweak(&mut config);
        Arc::new(GameClient::new(config, Credentials::new("alice", "secret")).unwrap())
    }

    /// Socket server that reports the request URI, optionally waits for the
    /// client's first frame, sends `frames`, then either closes or keeps the
    /// connection open until the client goes away.
    async fn socket_server(
        frames: Vec<String>,
        wait_for_client: bool,
        close: bool,
    ) -> (String, oneshot::Receiver<String>, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (uri_tx, uri_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut uri = None;
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                uri = Some(req.uri().to_string());
                Ok::<Response, ErrorResponse>(resp)
            })
            .await
            .unwrap();
            let _ = uri_tx.send(uri.unwrap_or_default());

            let mut received = Vec::new();
            if wait_for_client {
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        received.push(text);
                        break;
                    }
                }
            }

            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            if close {
                let _ = ws.send(Message::Close(None)).await;
            }

            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    received.push(text);
                }
            }
            received
        });
        (url, uri_rx, handle)
    }

    #[tokio::test]
    async fn test_rejected_login_is_fatal() {
        let backend = mock_backend(json!({ "errorMessage": "Invalid credentials", "user": null })).await;
        let client = make_client(&backend, None, |_| {});
        let result = run(client, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ClientError::Auth(AuthError::Rejected(_)))));
    }

    #[tokio::test]
    async fn test_login_timeout_while_waiting_for_two_factor() {
        let backend = mock_backend(json!({
            "errorMessage": "2FA required",
            "user": { "id": "1", "username": "alice", "isSignedIn": true }
        }))
        .await;
        let client = make_client(&backend, None, |_| {});
        let result = run(client.clone(), Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ClientError::LoginTimeout(_))));
        assert_eq!(client.auth().phase(), AuthPhase::Terminated);
    }

    #[tokio::test]
    async fn test_session_runs_until_server_closes() {
        let backend = mock_backend(signed_in()).await;
        let (socket, uri_rx, server) = socket_server(Vec::new(), false, true).await;
        let client = make_client(&backend, Some(socket), |_| {});

        let result = run(client.clone(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ClientError::Transport(TransportError::ClosedByServer))));

        let uri = uri_rx.await.unwrap();
        assert_eq!(uri, "/ws?token=tok-1&type=pong");
        server.await.unwrap();
        assert!(client.outbox().send_raw("late").is_err());
        assert!(client.auth().access_token().is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_is_not_an_error() {
        let backend = mock_backend(signed_in()).await;
        let state = json!({
            "target_endpoint": "pong-api",
            "type": "game_state",
            "game": {
                "id": "g1",
                "status": "playing",
                "ball": { "x": 0.5, "y": 0.5 },
                "leftPaddle": { "topPoint": { "x": 0, "y": 0.4 }, "height": 0.2 },
                "rightPaddle": { "topPoint": { "x": 0.99, "y": 0.4 }, "height": 0.2 }
            }
        });
        let (socket, uri_rx, server) = socket_server(vec![state.to_string()], true, false).await;
        let client = make_client(&backend, Some(socket), |_| {});

        // Enqueued before the socket exists; the server answers it with a state frame.
        client.create_match("Al").await.unwrap();
        assert!(!client.is_connected());
        let session = tokio::spawn(run(client.clone(), Duration::from_secs(5)));
        uri_rx.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.wait_connected()).await.unwrap();
        assert!(client.is_connected());

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.current_match().await.is_none() {
            assert!(Instant::now() < deadline, "game_state never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client.shutdown("user quit");
        let result = session.await.unwrap();
        assert_eq!(result.unwrap(), ExitReason::Graceful { reason: "user quit".into() });
        assert!(!client.is_connected());

        let received = server.await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].contains("create_game"));
    }

    #[tokio::test]
    async fn test_rejected_token_expires_session() {
        let backend = mock_backend(signed_in()).await;
        Mock::given(method("POST"))
            .and(path("/api/validate-access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "isAccessTokenValid": false })))
            .with_priority(1)
            .mount(&backend)
            .await;
        let (socket, _uri_rx, _server) = socket_server(Vec::new(), false, false).await;
        let client = make_client(&backend, Some(socket), |_| {});

        // The first check runs right after login, not one period later.
        let result = tokio::time::timeout(Duration::from_secs(5), run(client, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::SessionExpired)));
    }

    #[tokio::test]
    async fn test_zero_revalidate_interval_does_not_abort_session() {
        let backend = mock_backend(signed_in()).await;
        let (socket, uri_rx, _server) = socket_server(Vec::new(), false, false).await;
        let client = make_client(&backend, Some(socket), |config| {
            config.revalidate_interval = Duration::ZERO;
        });

        let session = tokio::spawn(run(client.clone(), Duration::from_secs(5)));
        uri_rx.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.wait_connected()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.is_finished());

        client.shutdown("done");
        let result = session.await.unwrap().unwrap();
        assert_eq!(result, ExitReason::Graceful { reason: "done".into() });
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_session_future_is_send() {
        let backend = mock_backend(signed_in()).await;
        let client = make_client(&backend, None, |_| {});
        let session = run(client, Duration::from_secs(5));
        assert_send(&session);
    }

    #[tokio::test]
    async fn test_shutdown_during_login() {
        let backend = mock_backend(json!({
            "errorMessage": "2FA required",
            "user": { "id": "1", "username": "alice", "isSignedIn": true }
        }))
        .await;
        let client = make_client(&backend, None, |_| {});
        let session = tokio::spawn(run(client.clone(), Duration::from_secs(30)));

        client.auth().wait_two_factor_required().await;
        client.shutdown("cancelled at prompt");
        let result = session.await.unwrap().unwrap();
        assert_eq!(result, ExitReason::Graceful { reason: "cancelled at prompt".into() });
    }

    #[tokio::test]
    async fn test_session_runs_once_per_client() {
        let backend = mock_backend(json!({ "errorMessage": "nope", "user": null })).await;
        let client = make_client(&backend, None, |_| {});
        let _ = run(client.clone(), Duration::from_secs(5)).await;
        assert!(matches!(run(client, Duration::from_secs(5)).await, Err(ClientError::AlreadyRunning)));
    }
}
