//! tutorlive - spoken tutoring sessions over the Gemini Live API
//!
//! Streams microphone audio to a remote tutor persona and plays its spoken
//! replies back with gap-free scheduling, handling barge-in interruptions and
//! collecting a speaker-tagged transcript of the conversation.

#![forbid(unsafe_code)]

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod interruption;
pub mod live;
pub mod playback;
pub mod transcript;

pub use config::{LiveConfig, SessionConfig};
pub use controller::{SessionController, SessionStatus};
pub use error::{Result, SessionError};
