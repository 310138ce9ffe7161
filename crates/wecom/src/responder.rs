//! Out-of-band reply delivery through a callback's `response_url`.

use {
    serde::Deserialize,
    sinobridge_channels::{markdown, text},
    tracing::info,
};

use crate::{CHANNEL_ID, error::{Error, Result}};

#[derive(Debug, Deserialize)]
struct ResponseUrlAnswer {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Sends degraded, chunked text to one message's response URL.
pub struct Responder {
    client: reqwest::Client,
}

impl Responder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Degrade markdown, chunk to the platform limit, and POST each chunk.
    pub async fn send_text(
        &self,
        response_url: &str,
        markdown_text: &str,
        chunk_limit: Option<usize>,
    ) -> Result<()> {
        let plain = markdown::strip_markdown(markdown_text);
        if plain.is_empty() {
            return Ok(());
        }
        let limit = text::resolve_chunk_limit(CHANNEL_ID, chunk_limit);
        let chunks = text::chunk_text(&plain, limit);
        info!(chunk_count = chunks.len(), "wecom robot response_url send");
        for chunk in &chunks {
            let body = serde_json::json!({
                "msgtype": "text",
                "text": { "content": chunk }
            });
            let answer: ResponseUrlAnswer = self
                .client
                .post(response_url)
                .timeout(std::time::Duration::from_secs(30))
                .json(&body)
                .send()
                .await?
                .json()
                .await?;
            if answer.errcode != 0 {
                return Err(Error::message(format!(
                    "response_url send failed: {} {}",
                    answer.errcode, answer.errmsg
                )));
            }
        }
        Ok(())
    }
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}
