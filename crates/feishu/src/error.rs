use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Media(#[from] sinobridge_media::Error),

    #[error("feishu api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("long connection closed")]
    ConnectionClosed,

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

    /// Codes that mean the cached tenant token is no longer accepted and
    /// a forced refresh is worth one retry.
    #[must_use]
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::Api { code, .. } if matches!(code, 99991661 | 99991663))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
