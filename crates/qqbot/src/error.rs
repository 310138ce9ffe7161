use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Media(#[from] sinobridge_media::Error),

    #[error(transparent)]
    Asr(#[from] sinobridge_asr::Error),

    #[error("qq api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("webhook signature invalid")]
    Signature,

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

    /// The platform refuses arbitrary file payloads in C2C/group chats.
    #[must_use]
    pub fn is_file_unsupported(&self) -> bool {
        matches!(self, Self::Api { code, message } if *code == 304023
            || message.contains("file_type")
            || message.contains("not support"))
    }

    /// The app access token is no longer accepted (a plain 401 or the
    /// platform's token-expired code); a forced refresh is worth one
    /// retry.
    #[must_use]
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::Api { code, .. } if matches!(code, 401 | 11244))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
