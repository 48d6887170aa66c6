//! Continuous Input
//!
//! Terminals report key repeats, not key releases. The throttler turns those
//! discrete presses into a press/release model (a key with no repeat for
//! `key_release_timeout` counts as released) and, while a key is held,
//! enqueues one intent message per tick.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::network::protocol::ClientRequest;
use crate::network::transport::Outbox;

// =============================================================================
// INPUT STATE
// =============================================================================

/// Paddle direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Move the paddle up.
    Up,
    /// Move the paddle down.
    Down,
}

impl Direction {
    /// Both directions, up first.
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];

    /// The other direction.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// State of one key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyState {
    /// Currently held.
    pub pressed: bool,
    /// Last press (or key repeat).
    pub last_press: Option<Instant>,
}

/// Pressed flags for both directions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputState {
    /// Up key.
    pub up: KeyState,
    /// Down key.
    pub down: KeyState,
}

impl InputState {
    /// Key state for a direction.
    pub fn key(&self, direction: Direction) -> &KeyState {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    fn key_mut(&mut self, direction: Direction) -> &mut KeyState {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }

    /// Set a pressed flag. Pressing refreshes the press timestamp.
    pub fn set(&mut self, direction: Direction, pressed: bool, now: Instant) {
        let key = self.key_mut(direction);
        key.pressed = pressed;
        if pressed {
            key.last_press = Some(now);
        }
    }

    /// Whether a direction is held.
    pub fn is_pressed(&self, direction: Direction) -> bool {
        self.key(direction).pressed
    }

    /// Whether nothing is held.
    pub fn is_released(&self) -> bool {
        !self.up.pressed && !self.down.pressed
    }

    /// Release everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// One throttler tick: auto-release stale keys, then report what is held.
    pub fn tick(&mut self, now: Instant, release_after: Duration) -> Vec<Direction> {
        let mut held = Vec::with_capacity(2);
        for direction in Direction::ALL {
            let key = self.key_mut(direction);
            if !key.pressed {
                continue;
            }
            let stale = key
                .last_press
                .map_or(true, |at| now.saturating_duration_since(at) > release_after);
            if stale {
                key.pressed = false;
                debug!("Auto-released {:?}", direction);
            } else {
                held.push(direction);
            }
        }
        held
    }
}

// =============================================================================
// THROTTLER
// =============================================================================

/// Periodic intent sender.
pub struct InputThrottler {
    state: Arc<Mutex<InputState>>,
    outbox: Outbox,
    tick_interval: Duration,
    release_after: Duration,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InputThrottler {
    /// Create a stopped throttler.
    pub fn new(outbox: Outbox, config: &ClientConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(InputState::default())),
            outbox,
            tick_interval: config.input_tick_interval(),
            release_after: config.key_release_timeout,
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Set a pressed flag (called by the key-handling layer).
    pub fn set_pressed(&self, direction: Direction, pressed: bool) {
        lock(&self.state).set(direction, pressed, Instant::now());
    }

    /// Press one direction and release the other.
    pub fn press(&self, direction: Direction) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.set(direction.opposite(), false, now);
        state.set(direction, true, now);
    }

    /// Copy of the current key state.
    pub fn snapshot(&self) -> InputState {
        *lock(&self.state)
    }

    /// Start the sender loop. No-op while already running.
    pub async fn start(&self, user_id: String) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let state = self.state.clone();
        let outbox = self.outbox.clone();
        let tick_interval = self.tick_interval;
        let release_after = self.release_after;

        *task = Some(tokio::spawn(async move {
            Self::run_loop(state, outbox, user_id, tick_interval, release_after).await;
        }));
        info!("Started continuous input sender");
    }

    /// Stop the sender loop and release every key.
    ///
    /// Returns once the loop has terminated; nothing is enqueued afterwards.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
            let _ = handle.await;
        }
        lock(&self.state).clear();
        info!("Stopped continuous input sender");
    }

    /// Whether the sender loop is running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn run_loop(
        state: Arc<Mutex<InputState>>,
        outbox: Outbox,
        user_id: String,
        tick_interval: Duration,
        release_after: Duration,
    ) {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let held = lock(&state).tick(Instant::now(), release_after);
            for direction in held {
                let request = ClientRequest::input(&user_id, direction);
                if let Err(e) = outbox.send(&request) {
                    warn!("Input sender stopping: {}", e);
                    return;
                }
            }
        }
    }
}

fn lock(state: &Mutex<InputState>) -> MutexGuard<'_, InputState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{OutboxReceiver, Outgoing};

    fn drain(rx: &mut OutboxReceiver) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outgoing::Text(frame) = item {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn test_tick_reports_held_keys() {
        let now = Instant::now();
        let mut state = InputState::default();
        state.set(Direction::Up, true, now);
        assert_eq!(state.tick(now, Duration::from_millis(200)), vec![Direction::Up]);
        assert!(state.is_pressed(Direction::Up));
        assert!(!state.is_pressed(Direction::Down));
    }

    #[test]
    fn test_key_auto_releases_after_timeout() {
        let start = Instant::now();
        let mut state = InputState::default();
        state.set(Direction::Down, true, start);

        let held = state.tick(start + Duration::from_millis(150), Duration::from_millis(200));
        assert_eq!(held, vec![Direction::Down]);

        let held = state.tick(start + Duration::from_millis(250), Duration::from_millis(200));
        assert!(held.is_empty());
        assert!(state.is_released());
    }

    #[test]
    fn test_repeat_refreshes_timestamp() {
        let start = Instant::now();
        let timeout = Duration::from_millis(200);
        let mut state = InputState::default();
        state.set(Direction::Up, true, start);
        state.set(Direction::Up, true, start + Duration::from_millis(150));
        assert_eq!(state.tick(start + Duration::from_millis(300), timeout), vec![Direction::Up]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_key_streams_intent() {
        let (outbox, mut rx) = Outbox::channel();
        let throttler = InputThrottler::new(outbox, &ClientConfig::default());

        throttler.start("alice".into()).await;
        throttler.press(Direction::Up);
        tokio::time::sleep(Duration::from_millis(100)).await;
        throttler.stop().await;

        let frames = drain(&mut rx);
        assert!(!frames.is_empty());
        let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["payload"]["type"], "input");
        assert_eq!(first["payload"]["pong_data"]["userId"], "alice");
        assert_eq!(first["payload"]["pong_data"]["up"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_key_released_without_explicit_release() {
        let (outbox, mut rx) = Outbox::channel();
        let throttler = InputThrottler::new(outbox, &ClientConfig::default());

        throttler.start("alice".into()).await;
        throttler.set_pressed(Direction::Down, true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(throttler.snapshot().is_released());
        drain(&mut rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());
        throttler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_twice_never_double_enqueues() {
        let (outbox, mut rx) = Outbox::channel();
        let throttler = InputThrottler::new(outbox, &ClientConfig::default());

        for _ in 0..2 {
            throttler.start("alice".into()).await;
            throttler.start("alice".into()).await;
            assert!(throttler.is_running().await);

            throttler.press(Direction::Down);
            tokio::time::sleep(Duration::from_millis(100)).await;
            throttler.stop().await;
            throttler.stop().await;

            // One loop at 60 Hz yields about seven frames in 100 ms; two would yield twice that.
            let frames = drain(&mut rx);
            assert!((5..=8).contains(&frames.len()), "got {} frames", frames.len());
            assert!(throttler.snapshot().is_released());
            assert!(!throttler.is_running().await);

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(drain(&mut rx).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_during_stop_is_released() {
        let (outbox, mut rx) = Outbox::channel();
        let throttler = InputThrottler::new(outbox, &ClientConfig::default());
        throttler.start("alice".into()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The press lands while stop() awaits the aborted loop.
        tokio::join!(throttler.stop(), async { throttler.press(Direction::Up) });

        assert!(throttler.snapshot().is_released());
        drain(&mut rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_when_transport_gone() {
        let (outbox, rx) = Outbox::channel();
        let throttler = InputThrottler::new(outbox, &ClientConfig::default());
        drop(rx);

        throttler.start("alice".into()).await;
        throttler.press(Direction::Up);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!throttler.is_running().await);
    }
}
