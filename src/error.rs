//! Error taxonomy for a live tutoring session.

use crate::codec::CodecError;

/// Error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The microphone could not be opened (access refused or no device).
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    /// The Live channel could not be established or the setup handshake failed.
    #[error("could not connect to the live service: {0}")]
    Connect(String),

    /// The Live channel dropped mid-session.
    #[error("connection lost: {0}")]
    Transport(String),

    /// A single inbound audio buffer could not be decoded.
    #[error("audio decode error: {0}")]
    Decode(#[from] CodecError),

    /// The output device failed.
    #[error("audio device error: {0}")]
    Device(String),

    /// The microphone stopped delivering audio mid-session.
    #[error("microphone error: {0}")]
    Microphone(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Whether the error ends the session. Only decode errors are local to one
    /// buffer.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Decode(_))
    }

    /// Short status line shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::PermissionDenied(_) => {
                "Microphone access was denied. Allow microphone access and start again.".to_string()
            }
            SessionError::Connect(_) => {
                "Could not connect to the tutor. Check your network and start again.".to_string()
            }
            SessionError::Transport(_) => {
                "Connection lost. Start a new session to continue.".to_string()
            }
            SessionError::Device(_) => {
                "The audio output device stopped working.".to_string()
            }
            SessionError::Microphone(_) => {
                "The microphone stopped working. Start a new session to continue.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_recoverable() {
        assert!(!SessionError::Decode(CodecError::Empty).is_fatal());
        assert!(SessionError::Transport("eof".into()).is_fatal());
        assert!(SessionError::PermissionDenied("no".into()).is_fatal());
        assert!(SessionError::Microphone("unplugged".into()).is_fatal());
    }

    #[test]
    fn test_user_message_mentions_connection_lost() {
        let msg = SessionError::Transport("reset by peer".into()).user_message();
        assert!(msg.starts_with("Connection lost"));
    }

    #[test]
    fn test_microphone_loss_is_not_reported_as_denial() {
        let msg = SessionError::Microphone("stream ended".into()).user_message();
        assert!(msg.starts_with("The microphone stopped working"));
        assert!(!msg.contains("denied"));
    }
}
