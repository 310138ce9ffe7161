use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Crypto(#[from] sinobridge_wecom_crypto::Error),

    #[error(transparent)]
    Media(#[from] sinobridge_media::Error),

    #[error(transparent)]
    Channel(#[from] sinobridge_channels::Error),

    #[error("wecom api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    /// Platform codes that mean the cached access token is no longer
    /// accepted and a forced refresh is worth one retry.
    #[must_use]
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::Api { code, .. } if matches!(code, 40014 | 41001 | 42001))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
