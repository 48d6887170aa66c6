//! Session Authentication
//!
//! Signs in against the backend's HTTP API, handles the optional second
//! factor, and keeps the short-lived access token fresh. The access token is
//! always fetched from the dedicated token endpoint, never taken from a
//! sign-in response body. The refresh credential lives in the cookie store.

use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClientConfig;

/// Authentication errors. All of them are fatal to the session.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Transport-level HTTP failure (including timeouts).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Sign-in refused.
    #[error("Authentication failed: {0}")]
    Rejected(String),

    /// Second factor refused.
    #[error("2FA validation failed: {0}")]
    TwoFactorRejected(String),

    /// The 2FA prompt went away without supplying a code.
    #[error("2FA prompt abandoned")]
    TwoFactorAbandoned,

    /// A code was submitted while no 2FA challenge was outstanding.
    #[error("No 2FA challenge pending")]
    NoTwoFactorPending,

    /// Token endpoint returned no token.
    #[error("Access token retrieval failed: {0}")]
    Token(String),

    /// Refresh did not yield a signed-in session.
    #[error("Failed to refresh access token: {0}")]
    Refresh(String),

    /// Operation needs a signed-in session.
    #[error("Not authenticated")]
    NotAuthenticated,
}

// =============================================================================
// DATA
// =============================================================================

/// Login credentials, fixed for the session's lifetime.
#[derive(Clone)]
pub struct Credentials {
    /// Username or email.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// User identity as reported by the backend.
///
/// Unknown fields are kept so the object can be echoed back verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// User identifier.
    #[serde(default)]
    pub id: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
    /// Username; also the `userId` carried by intent messages.
    #[serde(default)]
    pub username: String,
    /// Backend's signed-in flag.
    #[serde(default)]
    pub is_signed_in: bool,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Authenticated session.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Signed-in user.
    pub user: UserProfile,
    /// Current access token.
    pub access_token: String,
}

/// Authentication state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthPhase {
    /// No session yet, or a submitted 2FA code is being validated.
    #[default]
    Unauthenticated,
    /// Sign-in succeeded, waiting for the 2FA code.
    AwaitingTwoFactor,
    /// Token held.
    Authenticated,
    /// Session ended (explicit close or failed refresh).
    Terminated,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    username_or_email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    user: Option<UserProfile>,
}

#[derive(Serialize)]
struct TwoFactorRequest<'a> {
    user: &'a UserProfile,
    #[serde(rename = "code2Fa")]
    code: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorOnlyResponse {
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    user: &'a UserProfile,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    #[serde(default)]
    is_access_token_valid: bool,
    #[serde(default)]
    is_new_access_token_needed: bool,
    #[serde(default)]
    is_refresh_token_valid: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    is_signed_in: bool,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Session manager: sole writer of the token and identity fields.
pub struct AuthClient {
    config: ClientConfig,
    credentials: Credentials,
    http: reqwest::Client,
    user: RwLock<Option<UserProfile>>,
    token: watch::Sender<Option<String>>,
    phase: watch::Sender<AuthPhase>,
    two_factor: Mutex<Option<oneshot::Sender<String>>>,
}

impl AuthClient {
    /// Create a client with its own cookie store.
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.http_timeout)
            .build()?;
        let (token, _) = watch::channel(None);
        let (phase, _) = watch::channel(AuthPhase::Unauthenticated);

        Ok(Self {
            config,
            credentials,
            http,
            user: RwLock::new(None),
            token,
            phase,
            two_factor: Mutex::new(None),
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sign in, suspending for a 2FA code when the backend asks for one.
    #[instrument(skip(self), fields(user = %self.credentials.username))]
    pub async fn login(&self) -> Result<Session, AuthError> {
        self.phase.send_replace(AuthPhase::Unauthenticated);
        info!("Attempting authentication");

        let response: SignInResponse = self
            .http
            .post(self.config.api_url("/api/sign-in"))
            .json(&SignInRequest {
                username_or_email: &self.credentials.username,
                password: &self.credentials.password,
            })
            .send()
            .await?
            .json()
            .await?;

        let user = match response.user {
            Some(user) => user,
            None => {
                let message = non_empty_or(response.error_message, "Authentication failed");
                error!("Authentication failed: {}", message);
                return Err(AuthError::Rejected(message));
            }
        };

        if response.error_message.contains("2FA") {
            info!("2FA required, waiting for code");
            let code = self.await_two_factor_code().await?;
            self.validate_two_factor(&user, &code).await?;
        } else if !user.is_signed_in {
            return Err(AuthError::Rejected("user is not signed in".to_string()));
        }

        self.set_user(user.clone());
        let access_token = self.retrieve_access_token().await?;
        self.phase.send_replace(AuthPhase::Authenticated);
        info!("Authenticated as {}", user.username);

        Ok(Session { user, access_token })
    }

    async fn await_two_factor_code(&self) -> Result<String, AuthError> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.two_factor) = Some(tx);
        self.phase.send_replace(AuthPhase::AwaitingTwoFactor);

        let code = rx.await.map_err(|_| AuthError::TwoFactorAbandoned)?;
        self.phase.send_replace(AuthPhase::Unauthenticated);
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(AuthError::TwoFactorRejected("empty code".to_string()));
        }
        Ok(code)
    }

    async fn validate_two_factor(&self, user: &UserProfile, code: &str) -> Result<(), AuthError> {
        debug!("Validating 2FA code");
        let response: ErrorOnlyResponse = self
            .http
            .post(self.config.api_url("/api/validate-2fa"))
            .json(&TwoFactorRequest { user, code })
            .send()
            .await?
            .json()
            .await?;

        if !response.error_message.is_empty() {
            warn!("2FA rejected: {}", response.error_message);
            return Err(AuthError::TwoFactorRejected(response.error_message));
        }
        Ok(())
    }

    /// Supply the 2FA code. Fails if no challenge is outstanding.
    pub fn submit_two_factor(&self, code: impl Into<String>) -> Result<(), AuthError> {
        let tx = lock(&self.two_factor).take().ok_or(AuthError::NoTwoFactorPending)?;
        tx.send(code.into()).map_err(|_| AuthError::NoTwoFactorPending)
    }

    /// Whether a 2FA challenge is waiting for a code.
    pub fn two_factor_pending(&self) -> bool {
        lock(&self.two_factor).as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Resolve once login asks for a 2FA code.
    pub async fn wait_two_factor_required(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == AuthPhase::AwaitingTwoFactor).await;
    }

    /// Fetch the access token from the dedicated endpoint and store it.
    async fn retrieve_access_token(&self) -> Result<String, AuthError> {
        debug!("Retrieving access token");
        let response: TokenResponse = self
            .http
            .get(self.config.api_url("/api/ws-token"))
            .send()
            .await?
            .json()
            .await?;

        match response.token {
            Some(token) if response.error_message.is_empty() && !token.is_empty() => {
                self.token.send_replace(Some(token.clone()));
                Ok(token)
            }
            _ => {
                let message = non_empty_or(response.error_message, "Failed to retrieve access token");
                error!("Failed to get access token: {}", message);
                Err(AuthError::Token(message))
            }
        }
    }

    /// Ask the backend whether the token is still valid, refreshing it when
    /// the backend says a refresh is possible.
    #[instrument(skip(self))]
    pub async fn revalidate(&self) -> Result<bool, AuthError> {
        let (token, user) = match (self.access_token(), self.user()) {
            (Some(token), Some(user)) => (token, user),
            _ => return Err(AuthError::NotAuthenticated),
        };

        let response: ValidateResponse = self
            .http
            .post(self.config.api_url("/api/validate-access-token"))
            .bearer_auth(token)
            .json(&ValidateRequest { user: &user })
            .send()
            .await?
            .json()
            .await?;

        if response.is_access_token_valid {
            debug!("Access token valid");
            return Ok(true);
        }
        if response.is_new_access_token_needed && response.is_refresh_token_valid {
            info!("Access token expired, refreshing");
            self.refresh().await?;
            return Ok(true);
        }
        warn!("Access token no longer valid");
        Ok(false)
    }

    /// Mint a new access token with the refresh cookie.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let response: RefreshResponse = self
            .http
            .post(self.config.api_url("/api/generate-new-access-token"))
            .send()
            .await?
            .json()
            .await?;

        if !response.error_message.is_empty() {
            error!("Failed to refresh access token: {}", response.error_message);
            self.phase.send_replace(AuthPhase::Terminated);
            return Err(AuthError::Refresh(response.error_message));
        }

        if let (Some(id), Some(email), Some(username)) =
            (response.user_id, response.email, response.username)
        {
            let mut guard = self.user.write().unwrap_or_else(|p| p.into_inner());
            let user = guard.get_or_insert_with(UserProfile::default);
            user.id = id;
            user.email = email;
            user.username = username;
            user.is_signed_in = response.is_signed_in;
        }

        let access_token = self.retrieve_access_token().await?;
        if !response.is_signed_in {
            self.phase.send_replace(AuthPhase::Terminated);
            return Err(AuthError::Refresh("user is not signed in".to_string()));
        }

        self.phase.send_replace(AuthPhase::Authenticated);
        let user = self.user().ok_or(AuthError::NotAuthenticated)?;
        info!("Access token refreshed for {}", user.username);
        Ok(Session { user, access_token })
    }

    /// Resolve with the access token once one is held.
    pub async fn wait_for_token(&self) -> String {
        let mut rx = self.token.subscribe();
        loop {
            if let Some(token) = rx.borrow_and_update().clone() {
                return token;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Mark the session terminated and drop the token.
    pub fn terminate(&self) {
        self.token.send_replace(None);
        self.phase.send_replace(AuthPhase::Terminated);
        lock(&self.two_factor).take();
    }

    /// Current access token.
    pub fn access_token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    /// Current identity.
    pub fn user(&self) -> Option<UserProfile> {
        self.user.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Name carried by intent messages: the backend username, or the login
    /// name until one is known.
    pub fn username(&self) -> String {
        self.user()
            .map(|u| u.username)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.credentials.username.clone())
    }

    /// Current state machine phase.
    pub fn phase(&self) -> AuthPhase {
        *self.phase.borrow()
    }

    fn set_user(&self, user: UserProfile) {
        *self.user.write().unwrap_or_else(|p| p.into_inner()) = Some(user);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn non_empty_or(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
