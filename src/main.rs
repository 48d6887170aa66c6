//! Pong Client
//!
//! Headless driver: signs in, keeps the session alive and logs what the
//! server reports. Ctrl-C exits gracefully.
//!
//! Usage: `pong-client [BACKEND_URL]`. Credentials come from
//! `PONG_USERNAME`/`PONG_PASSWORD` or an interactive prompt.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pong_client::{
    network::session, ClientConfig, Credentials, ExitReason, GameClient, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("Pong Client v{}", VERSION);

    let mut config = ClientConfig::from_env();
    if let Some(url) = std::env::args().nth(1) {
        config = config.with_backend_url(url);
    }
    info!("Backend: {}", config.backend_url);

    let credentials = read_credentials().context("reading credentials")?;
    let login_timeout = config.login_timeout;
    let client = Arc::new(GameClient::new(config, credentials)?);

    tokio::spawn(two_factor_prompt(client.clone()));
    tokio::spawn(report_loop(client.clone()));

    let ctrl_c_client = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_client.shutdown("interrupted");
        }
    });

    match session::run(client, login_timeout).await {
        Ok(ExitReason::Graceful { reason }) => {
            info!("Exiting: {}", reason);
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    Ok(())
}

fn read_credentials() -> io::Result<Credentials> {
    let username = match std::env::var("PONG_USERNAME") {
        Ok(name) => name,
        Err(_) => prompt("Username or email: ")?,
    };
    let password = match std::env::var("PONG_PASSWORD") {
        Ok(password) => password,
        Err(_) => prompt("Password: ")?,
    };
    Ok(Credentials::new(username, password))
}

fn prompt(label: &str) -> io::Result<String> {
    let mut stdout = io::stdout();
    stdout.write_all(label.as_bytes())?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Ask for the 2FA code whenever login requests one.
async fn two_factor_prompt(client: Arc<GameClient>) {
    loop {
        client.auth().wait_two_factor_required().await;
        let code = match tokio::task::spawn_blocking(|| prompt("2FA code: ")).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                warn!("Could not read 2FA code: {}", e);
                return;
            }
            Err(_) => return,
        };
        if let Err(e) = client.auth().submit_two_factor(code) {
            warn!("{}", e);
            return;
        }
    }
}

/// Log faults and match transitions once per second.
async fn report_loop(client: Arc<GameClient>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_status = None;
    loop {
        ticker.tick().await;
        if let Some(fault) = client.current_fault() {
            warn!("Server error {}: {}", fault.code, fault.message);
        }
        if let Some(game_over) = client.take_game_over().await {
            info!("Game over: winner {:?}", game_over.winner_id);
        }
        if let Some(summary) = client.take_tournament_end().await {
            info!("Tournament over: {}", summary);
        }
        let status = client.current_match().await.map(|m| (m.id, m.status));
        if status != last_status {
            info!("Match: {:?}", status);
            last_status = status;
        }
    }
}
