//! Session controller
//!
//! Starts and ends sessions and runs each session's event loop. The loop task
//! is the only owner of the [`SessionConnection`]: inbound messages, captured
//! frames, playback completions and the silence deadline are handled one at a
//! time through `tokio::select!`.

use crate::audio::AudioBackend;
use crate::capture::MuteSwitch;
use crate::config::{LiveConfig, SessionConfig};
use crate::connection::{SessionConnection, SessionEvents};
use crate::error::{Result, SessionError};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

/// Coarse session status for the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Ended,
    /// Ended by an error; carries the message to show the user
    Failed(String),
}

struct ActiveSession {
    stop: oneshot::Sender<()>,
    task: JoinHandle<String>,
}

pub struct SessionController {
    backend: Arc<dyn AudioBackend>,
    live: LiveConfig,
    mute: MuteSwitch,
    speaking: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<SessionStatus>>,
    session: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn AudioBackend>, live: LiveConfig) -> Self {
        let (speaking, _) = watch::channel(false);
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            backend,
            live,
            mute: MuteSwitch::new(),
            speaking: Arc::new(speaking),
            status: Arc::new(status),
            session: None,
        }
    }

    /// Start a new session, ending the current one first.
    pub async fn start(&mut self, config: SessionConfig) -> Result<()> {
        if self.session.is_some() {
            info!("Ending previous session before starting a new one");
            self.end().await;
        }

        self.mute.set_muted(false);
        self.speaking.send_replace(false);
        self.status.send_replace(SessionStatus::Connecting);

        let mut connection =
            SessionConnection::new(config, self.live.clone()).with_mute(self.mute.clone());
        let events = match connection.open(self.backend.as_ref()).await {
            Ok(events) => events,
            Err(e) => {
                self.status.send_replace(SessionStatus::Failed(e.user_message()));
                return Err(e);
            }
        };

        self.status.send_replace(SessionStatus::Connected);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            connection,
            events,
            stop_rx,
            self.speaking.clone(),
            self.status.clone(),
        ));
        self.session = Some(ActiveSession { stop, task });
        Ok(())
    }

    /// End the current session and return its transcript. Returns an empty
    /// string when no session is active.
    pub async fn end(&mut self) -> String {
        let Some(session) = self.session.take() else {
            return String::new();
        };
        let _ = session.stop.send(());
        let transcript = match session.task.await {
            Ok(transcript) => transcript,
            Err(e) => {
                error!("Session task failed: {}", e);
                String::new()
            }
        };
        self.speaking.send_replace(false);
        self.status.send_replace(SessionStatus::Ended);
        info!("Session ended");
        transcript
    }

    pub fn toggle_mute(&self) {
        let muted = self.mute.toggle();
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }

    /// Whether the agent is currently speaking.
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

/// Resolves at `deadline`, or never.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    mut connection: SessionConnection,
    mut events: SessionEvents,
    mut stop: oneshot::Receiver<()>,
    speaking: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<SessionStatus>>,
) -> String {
    info!("Session event loop started");

    loop {
        let deadline = connection.silence_deadline();
        let mut failure: Option<SessionError> = None;

        tokio::select! {
            _ = &mut stop => break,
            Some(message) = events.inbound.recv() => match message {
                Ok(message) => {
                    if let Err(e) = connection.on_message(message, Instant::now()) {
                        failure = Some(e);
                    }
                }
                Err(e) => failure = Some(e),
            },
            frame = events.frames.recv() => match frame {
                Some(frame) => connection.send(frame),
                None => {
                    failure = Some(SessionError::Microphone("capture stream ended".to_string()))
                }
            },
            Some(voice) = events.ended.recv() => {
                connection.on_playback_ended(voice, Instant::now());
            }
            _ = sleep_until(deadline) => {
                connection.settle_playback(Instant::now());
            }
        }

        speaking.send_if_modified(|current| {
            let now = connection.is_speaking();
            let changed = *current != now;
            *current = now;
            changed
        });

        if let Some(e) = failure {
            connection.on_error(&e);
            connection.close();
            speaking.send_replace(false);
            status.send_replace(SessionStatus::Failed(e.user_message()));
            // Keep the transcript until the session is ended
            let _ = stop.await;
            break;
        }
    }

    connection.close();
    connection.transcript().to_text()
}
