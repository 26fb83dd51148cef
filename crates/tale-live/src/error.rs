//! Error types for live sessions

use crate::state::ConnectionState;
use tale_core::TaleError;
use thiserror::Error;

/// Result type alias for live-session operations
pub type LiveResult<T> = Result<T, LiveError>;

#[derive(Error, Debug)]
pub enum LiveError {
    /// Backend tool executor failed; carries the backend's own message.
    #[error("Tool relay error: {0}")]
    ToolRelay(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Codec error: {0}")]
    Codec(String),

    /// The trusted backend refused or failed to issue a ticket.
    #[error("Ticket error: {0}")]
    Ticket(#[from] TaleError),
}

impl LiveError {
    /// The one string shown to the user when a session dies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) | Self::Protocol(_) => {
                "Lost connection to the storyteller. Please reconnect.".to_string()
            }
            Self::Ticket(e) if e.is_policy_rejection() => {
                "The storyteller is resting right now. Please try again later.".to_string()
            }
            Self::Ticket(_) => "Could not start a live session. Please try again.".to_string(),
            Self::AudioDevice(_) => "Your microphone or speaker is not available.".to_string(),
            Self::ToolRelay(_) | Self::IllegalTransition { .. } | Self::Codec(_) => {
                "Something went wrong with the live session.".to_string()
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LiveError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        LiveError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for LiveError {
    fn from(err: base64::DecodeError) -> Self {
        LiveError::Codec(err.to_string())
    }
}

impl From<reqwest::Error> for LiveError {
    fn from(err: reqwest::Error) -> Self {
        LiveError::ToolRelay(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for LiveError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for LiveError {
    fn from(err: cpal::BuildStreamError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for LiveError {
    fn from(err: cpal::PlayStreamError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}
