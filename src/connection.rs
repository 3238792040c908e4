//! Session connection state machine
//!
//! A [`SessionConnection`] owns everything one conversation needs: the Live
//! channel, the microphone and its capture task, the playback scheduler and
//! the transcript. It is driven by a single event loop (see
//! `controller::SessionController`), which feeds it inbound messages,
//! captured frames and playback completions through `&mut self`, so all of its
//! state is mutated from one place.

use crate::audio::{AudioBackend, DeviceGuard, Microphone, VoiceId};
use crate::capture::{CaptureHandle, CaptureInput, MuteSwitch};
use crate::codec::{decode_base64_pcm16, AudioFrame};
use crate::config::{LiveConfig, SessionConfig};
use crate::error::{Result, SessionError};
use crate::interruption::InterruptionHandler;
use crate::live::{BidiGenerateContentSetup, LiveChannel, ServerMessage};
use crate::playback::PlaybackScheduler;
use crate::transcript::{Speaker, TranscriptAccumulator};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Ended by `close()`. Terminal.
    Closed,
    /// Failed. Terminal.
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Event streams of an open session, consumed by the event loop.
pub struct SessionEvents {
    /// Server messages; a transport failure arrives as the final `Err`
    pub inbound: mpsc::Receiver<Result<ServerMessage>>,
    /// Encoded microphone frames, in capture order
    pub frames: mpsc::Receiver<AudioFrame>,
    /// Voices that finished playing on their own
    pub ended: mpsc::UnboundedReceiver<VoiceId>,
}

pub struct SessionConnection {
    config: SessionConfig,
    live: LiveConfig,
    state: ConnectionState,
    mute: MuteSwitch,
    channel: Option<LiveChannel>,
    capture: Option<CaptureHandle>,
    microphone: Option<DeviceGuard>,
    scheduler: Option<PlaybackScheduler>,
    interruption: InterruptionHandler,
    transcript: TranscriptAccumulator,
    status_message: Option<String>,
}

impl SessionConnection {
    pub fn new(config: SessionConfig, live: LiveConfig) -> Self {
        Self {
            config,
            live,
            state: ConnectionState::Connecting,
            mute: MuteSwitch::new(),
            channel: None,
            capture: None,
            microphone: None,
            scheduler: None,
            interruption: InterruptionHandler::new(),
            transcript: TranscriptAccumulator::new(),
            status_message: None,
        }
    }

    /// Gate capture on an existing mute switch instead of a private one.
    pub fn with_mute(mut self, mute: MuteSwitch) -> Self {
        self.mute = mute;
        self
    }

    /// Acquire the devices, connect and start capturing.
    ///
    /// On failure everything acquired so far is released and the connection
    /// ends up `Errored`.
    pub async fn open(&mut self, backend: &dyn AudioBackend) -> Result<SessionEvents> {
        if self.state != ConnectionState::Connecting {
            return Err(SessionError::Connect(format!(
                "cannot open a connection in state {:?}",
                self.state
            )));
        }

        match self.acquire(backend).await {
            Ok(events) => {
                self.state = ConnectionState::Connected;
                info!("Session connected");
                Ok(events)
            }
            Err(e) => {
                error!("Failed to open session: {}", e);
                self.release_resources();
                self.state = ConnectionState::Errored;
                self.status_message = Some(e.user_message());
                Err(e)
            }
        }
    }

    async fn acquire(&mut self, backend: &dyn AudioBackend) -> Result<SessionEvents> {
        let Microphone { windows, device } =
            backend.open_microphone(self.live.input_sample_rate, self.live.capture_window)?;
        self.microphone = Some(device);

        let (ended_tx, ended) = mpsc::unbounded_channel();
        let output = backend.open_speaker(self.live.output_sample_rate, ended_tx)?;
        self.scheduler = Some(PlaybackScheduler::new(output, self.live.speaking_grace));

        let setup = BidiGenerateContentSetup::for_session(&self.live, &self.config);
        let (channel, inbound) = LiveChannel::connect(
            &self.live.url,
            setup,
            self.live.setup_timeout,
            self.live.input_sample_rate,
        )
        .await?;
        self.channel = Some(channel);

        let (frames_tx, frames) = mpsc::channel(32);
        self.capture = Some(CaptureInput::new(self.mute.clone()).spawn(windows, frames_tx));

        Ok(SessionEvents {
            inbound,
            frames,
            ended,
        })
    }

    /// Stream one microphone frame. Dropped unless connected.
    pub fn send(&mut self, frame: AudioFrame) {
        let channel = match (&self.state, &self.channel) {
            (ConnectionState::Connected, Some(channel)) => channel,
            _ => {
                trace!("Dropping frame {} in state {:?}", frame.seq, self.state);
                return;
            }
        };
        if let Err(e) = channel.send_audio(&frame) {
            // Racing a close; the frame is lost either way
            debug!("Frame {} not sent: {}", frame.seq, e);
        }
    }

    /// Dispatch one server message. Interruption is handled first, so audio in
    /// the same message belongs to the new reply. Returns an error only when
    /// the output device fails.
    pub fn on_message(&mut self, message: ServerMessage, now: Instant) -> Result<()> {
        if message.go_away.is_some() {
            warn!("Server announced disconnect (goAway)");
        }
        if message.session_resumption_update.is_some() {
            debug!("Ignoring session resumption update");
        }
        let Some(content) = message.server_content else {
            return Ok(());
        };
        if self.state != ConnectionState::Connected {
            trace!("Ignoring server content in state {:?}", self.state);
            return Ok(());
        }
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(());
        };

        if content.interrupted {
            self.interruption.interrupt(scheduler);
        }

        if let Some(transcription) = &content.input_transcription {
            if !transcription.text.is_empty() {
                self.transcript.append(Speaker::User, transcription.text.as_str());
            }
        }
        if let Some(transcription) = &content.output_transcription {
            if !transcription.text.is_empty() {
                self.transcript.append(Speaker::Tutor, transcription.text.as_str());
            }
        }

        for payload in content.audio_payloads() {
            match decode_base64_pcm16(payload, self.live.output_sample_rate) {
                Ok(buffer) => {
                    scheduler.enqueue(buffer)?;
                }
                Err(e) => warn!("Skipping undecodable audio buffer: {}", e),
            }
        }

        if content.generation_complete {
            debug!("Generation complete");
        }
        if content.is_turn_complete() {
            debug!("Turn complete");
            scheduler.turn_complete(now);
        }
        Ok(())
    }

    pub fn on_playback_ended(&mut self, voice: VoiceId, now: Instant) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.on_ended(voice, now);
        }
    }

    /// Run the scheduler's pending silence check.
    pub fn settle_playback(&mut self, now: Instant) -> bool {
        self.scheduler
            .as_mut()
            .map(|scheduler| scheduler.settle(now))
            .unwrap_or(false)
    }

    pub fn silence_deadline(&self) -> Option<Instant> {
        self.scheduler
            .as_ref()
            .and_then(|scheduler| scheduler.silence_deadline())
    }

    /// Record a fatal error. Resources stay held until `close()`.
    pub fn on_error(&mut self, err: &SessionError) {
        if self.state.is_terminal() {
            debug!("Ignoring error after close: {}", err);
            return;
        }
        error!("Session error: {}", err);
        self.state = ConnectionState::Errored;
        self.status_message = Some(err.user_message());
    }

    /// End the session and release every resource. Idempotent.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = ConnectionState::Closed;
        }
        if self.release_resources() {
            info!(
                "Session closed ({} transcript lines, {} interruptions)",
                self.transcript.len(),
                self.interruption.count()
            );
        }
    }

    fn release_resources(&mut self) -> bool {
        let mut released = false;
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            released = true;
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
            released = true;
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.release();
            released = true;
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            released = true;
        }
        released
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transcript(&self) -> &TranscriptAccumulator {
        &self.transcript
    }

    /// User-facing message of the error that ended the session, if any.
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn mute(&self) -> &MuteSwitch {
        &self.mute
    }

    pub fn is_speaking(&self) -> bool {
        self.scheduler
            .as_ref()
            .map(|scheduler| scheduler.is_speaking())
            .unwrap_or(false)
    }

    pub fn interruptions(&self) -> u64 {
        self.interruption.count()
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.close();
    }
}
