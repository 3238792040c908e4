//! Gemini Live API channel
//!
//! Typed wire messages plus a WebSocket client split into a writer task (one
//! FIFO of outbound messages, so frames go out in the order they were sent)
//! and a reader task that parses server messages onto an mpsc channel.

use crate::codec::AudioFrame;
use crate::config::{LiveConfig, SessionConfig};
use crate::error::{Result, SessionError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Messages the setup handshake may skip before giving up on `setupComplete`.
const SETUP_SKIP_LIMIT: usize = 10;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Enables transcription of one audio direction. Serialized as `{}`.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64 media payload
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    /// Setup for a spoken session: audio replies in the configured voice, with
    /// both directions transcribed.
    pub fn for_session(live: &LiveConfig, session: &SessionConfig) -> Self {
        Self {
            model: live.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                temperature: live.temperature,
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: session.voice_name.clone(),
                        },
                    },
                }),
            }),
            system_instruction: Some(Content {
                parts: vec![Part {
                    text: Some(session.system_instruction.clone()),
                    inline_data: None,
                }],
            }),
            input_audio_transcription: Some(AudioTranscriptionConfig::default()),
            output_audio_transcription: Some(AudioTranscriptionConfig::default()),
        }
    }
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
}

impl RealtimeInput {
    pub fn audio(frame: &AudioFrame, sample_rate: u32) -> Self {
        Self {
            audio: Some(Blob {
                mime_type: format!("audio/pcm;rate={}", sample_rate),
                data: frame.to_base64(),
            }),
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

/// Server -> client message. Exactly one field is normally set; unknown
/// message kinds deserialize with every field empty.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
    #[serde(default)]
    pub session_resumption_update: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

impl ServerContent {
    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete
            || self
                .model_turn
                .as_ref()
                .map(|turn| turn.turn_complete)
                .unwrap_or(false)
    }

    /// Base64 audio payloads of the model turn, in part order.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .map(|blob| blob.data.as_str())
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

/// Outcome of reading one WebSocket frame.
enum Frame {
    Server(ServerMessage),
    Closed(String),
    Skip,
}

fn classify(message: Message) -> Frame {
    let text = match &message {
        Message::Text(text) => text.as_str(),
        // The service frequently sends JSON in binary frames
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary message ({} bytes)", bytes.len());
                return Frame::Skip;
            }
        },
        Message::Close(frame) => {
            let reason = frame
                .as_ref()
                .map(|f| format!("{} {}", f.code, f.reason.as_str()))
                .unwrap_or_else(|| "no close frame".to_string());
            return Frame::Closed(reason);
        }
        _ => return Frame::Skip,
    };

    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Frame::Server(message),
        Err(e) => {
            warn!("Failed to parse server message: {}", e);
            debug!("Raw message: {}", text);
            Frame::Skip
        }
    }
}

/// Open duplex channel to the Live API.
pub struct LiveChannel {
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    input_sample_rate: u32,
}

impl LiveChannel {
    /// Connect, send `setup` and wait for `setupComplete`. Returns the channel
    /// and the stream of inbound messages; a transport failure arrives on that
    /// stream as `Err(SessionError::Transport)` and ends it.
    pub async fn connect(
        url: &str,
        setup: BidiGenerateContentSetup,
        setup_timeout: Duration,
        input_sample_rate: u32,
    ) -> Result<(Self, mpsc::Receiver<Result<ServerMessage>>)> {
        info!("Connecting to Live API (model {})", setup.model);

        let (ws, resp) = connect_async(url)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut source) = ws.split();

        let setup_json = serde_json::to_string(&ClientMessage::Setup(setup))?;
        sink.send(Message::text(setup_json))
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        info!("Setup message sent, waiting for acknowledgment");

        tokio::time::timeout(setup_timeout, wait_for_setup_complete(&mut source))
            .await
            .map_err(|_| SessionError::Connect("timed out waiting for setupComplete".to_string()))??;
        info!("Live session setup complete");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(100);

        let writer = tokio::spawn(run_writer(sink, outbound_rx, inbound_tx.clone()));
        let reader = tokio::spawn(run_reader(source, inbound_tx));

        Ok((
            Self {
                outbound: Some(outbound_tx),
                writer: Some(writer),
                reader: Some(reader),
                input_sample_rate,
            },
            inbound_rx,
        ))
    }

    /// Queue a message for the writer task. Fails once the channel is closed.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| SessionError::Transport("channel closed".to_string()))?;
        outbound
            .send(message)
            .map_err(|_| SessionError::Transport("writer stopped".to_string()))
    }

    pub fn send_audio(&self, frame: &AudioFrame) -> Result<()> {
        self.send(ClientMessage::RealtimeInput(RealtimeInput::audio(
            frame,
            self.input_sample_rate,
        )))
    }

    pub fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    /// Tear the channel down. Messages still queued are discarded. Idempotent.
    pub fn close(&mut self) {
        if self.outbound.take().is_none() {
            return;
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!("Live channel closed");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn wait_for_setup_complete(source: &mut WsSource) -> Result<()> {
    let mut skipped = 0;
    while skipped < SETUP_SKIP_LIMIT {
        match source.next().await {
            Some(Ok(message)) => match classify(message) {
                Frame::Server(message) if message.setup_complete.is_some() => return Ok(()),
                Frame::Closed(reason) => {
                    return Err(SessionError::Connect(format!(
                        "closed during setup: {}",
                        reason
                    )))
                }
                Frame::Server(_) | Frame::Skip => skipped += 1,
            },
            Some(Err(e)) => return Err(SessionError::Connect(e.to_string())),
            None => return Err(SessionError::Connect("closed during setup".to_string())),
        }
    }
    Err(SessionError::Connect("setup was not acknowledged".to_string()))
}

async fn run_writer(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::Sender<Result<ServerMessage>>,
) {
    while let Some(message) = outbound.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize client message: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::text(json)).await {
            error!("Failed to send message: {}", e);
            let _ = inbound.send(Err(SessionError::Transport(e.to_string()))).await;
            return;
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(mut source: WsSource, inbound: mpsc::Sender<Result<ServerMessage>>) {
    info!("Inbound message task started");
    let reason = loop {
        match source.next().await {
            Some(Ok(message)) => match classify(message) {
                Frame::Server(message) => {
                    if inbound.send(Ok(message)).await.is_err() {
                        debug!("Inbound receiver dropped");
                        return;
                    }
                }
                Frame::Closed(reason) => break format!("closed by server ({})", reason),
                Frame::Skip => {}
            },
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        }
    };
    warn!("Live connection ended: {}", reason);
    let _ = inbound.send(Err(SessionError::Transport(reason))).await;
}
