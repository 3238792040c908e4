//! Session and connection configuration
//!
//! Settings come from the environment. `GEMINI_API_KEY` selects the public
//! Live endpoint; `TUTOR_LIVE_URL` overrides the endpoint entirely (proxies,
//! local test servers).

use crate::capture::{DEFAULT_CAPTURE_WINDOW, MAX_CAPTURE_WINDOW};
use crate::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::{Result, SessionError};
use crate::playback::DEFAULT_SPEAKING_GRACE;
use std::time::Duration;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a patient, encouraging tutor. \
Talk with the student about what they want to learn, ask short questions to find \
out what they already know, and keep each answer brief so the conversation stays \
spoken and natural.";

/// Per-session options, fixed once the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Persona and behaviour of the agent
    pub system_instruction: String,
    /// Prebuilt synthesis voice
    pub voice_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice_name: "Puck".to_string(),
        }
    }
}

/// Connection and audio settings shared by every session.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per capture window
    pub capture_window: usize,
    /// How long playback must stay idle before the agent counts as silent
    pub speaking_grace: Duration,
    /// Limit for the setup handshake
    pub setup_timeout: Duration,
    /// PulseAudio source name; default source when unset
    pub input_device: Option<String>,
    /// PulseAudio sink name; default sink when unset
    pub output_device: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            temperature: Some(0.7),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_window: DEFAULT_CAPTURE_WINDOW,
            speaking_grace: DEFAULT_SPEAKING_GRACE,
            setup_timeout: Duration::from_secs(10),
            input_device: None,
            output_device: None,
        }
    }
}

impl LiveConfig {
    /// Config for the public endpoint authenticated with `api_key`.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            ..Default::default()
        }
    }

    /// Config for an explicit endpoint URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match (lookup("TUTOR_LIVE_URL"), lookup("GEMINI_API_KEY")) {
            (Some(url), _) => Self::with_url(url),
            (None, Some(key)) => Self::from_api_key(&key),
            (None, None) => {
                return Err(SessionError::Config(
                    "set GEMINI_API_KEY (or TUTOR_LIVE_URL)".to_string(),
                ))
            }
        };

        if let Some(model) = lookup("TUTOR_MODEL") {
            config.model = model;
        }
        if let Some(window) = lookup("TUTOR_CAPTURE_WINDOW") {
            config.capture_window = window
                .parse::<usize>()
                .ok()
                .filter(|w| (1..=MAX_CAPTURE_WINDOW).contains(w))
                .ok_or_else(|| {
                    SessionError::Config(format!("invalid TUTOR_CAPTURE_WINDOW: {}", window))
                })?;
        }
        config.input_device = lookup("TUTOR_INPUT_DEVICE");
        config.output_device = lookup("TUTOR_OUTPUT_DEVICE");

        Ok(config)
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            system_instruction: lookup("TUTOR_SYSTEM_INSTRUCTION")
                .unwrap_or(defaults.system_instruction),
            voice_name: lookup("TUTOR_VOICE").unwrap_or(defaults.voice_name),
        }
    }
}
