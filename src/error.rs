//! Error types for PetalMix

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PetalMixError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("PetalMix is not initialized")]
    NotInitialized,

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("{0}")]
    Misuse(String),

    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Unsupported platform: {0}")]
    Unsupported(String),
}

impl PetalMixError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PetalMixError>;
