//! Speech-to-text port.
//!
//! Voice messages without platform-side recognition go through this narrow
//! interface. The only shipped backend is Tencent Flash ASR.

pub mod tencent;

use {async_trait::async_trait, bytes::Bytes};

pub use tencent::{TencentFlashAsr, TencentFlashConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("asr backend not configured")]
    NotConfigured,

    #[error("asr request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("asr backend error {code}: {message}")]
    Backend { code: i64, message: String },

    #[error("asr response unreadable: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Request to transcribe one voice message.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    /// Raw audio bytes.
    pub audio: Bytes,
    /// Container/codec tag as the backend expects it ("amr", "mp3", "wav", "ogg-opus").
    pub voice_format: String,
}

/// Transcription result.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub duration_ms: Option<u64>,
}

/// Speech-to-text provider.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Provider identifier (e.g. "tencent-flash").
    fn id(&self) -> &'static str;

    /// Whether credentials are present and plausible.
    fn is_configured(&self) -> bool;

    async fn transcribe(&self, request: TranscribeRequest) -> Result<Transcript>;
}
