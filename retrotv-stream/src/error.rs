use thiserror::Error;

/// Typed session failures; the transport boundary maps these to protocol
/// responses without the core depending on transport semantics.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Channel {0} not found")]
    ChannelNotFound(u32),

    #[error("Transcode config '{0}' not found")]
    TranscodeConfigNotFound(String),

    #[error("Session failed: {0}")]
    Generic(#[from] anyhow::Error),
}

impl From<retrotv_core::Error> for SessionError {
    fn from(err: retrotv_core::Error) -> Self {
        Self::Generic(anyhow::Error::new(err))
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
