use std::error::Error as StdError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The body exceeded the configured size cap; the download was aborted.
    #[error("media exceeds the {limit_bytes} byte limit")]
    SizeLimit { limit_bytes: u64 },

    #[error("{message}")]
    InvalidInput { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn is_size_limit(&self) -> bool {
        matches!(self, Self::SizeLimit { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
