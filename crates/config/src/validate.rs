use base64::Engine;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("encodingAESKey must be 43 base64 characters, got {length}")]
    AesKeyLength { length: usize },

    #[error("encodingAESKey is not valid base64")]
    AesKeyEncoding,

    #[error("encodingAESKey must decode to 32 bytes, got {length}")]
    AesKeySize { length: usize },

    #[error("agentId must be a positive integer")]
    AgentId,
}

/// WeCom `encodingAESKey` validation: exactly 43 base64 characters that,
/// padded with one `=`, decode to a 32-byte AES key.
pub fn validate_aes_key(key: &str) -> Result<[u8; 32], ValidationError> {
    let trimmed = key.trim_end_matches('=');
    if trimmed.len() != 43 {
        return Err(ValidationError::AesKeyLength {
            length: trimmed.len(),
        });
    }
    let padded = format!("{trimmed}=");
    let decoded = lenient_base64()
        .decode(padded)
        .map_err(|_| ValidationError::AesKeyEncoding)?;
    <[u8; 32]>::try_from(decoded.as_slice()).map_err(|_| ValidationError::AesKeySize {
        length: decoded.len(),
    })
}

/// WeCom `encodingAESKey` values sometimes carry non-zero trailing bits in
/// the final character; the platform accepts them, so we must too.
fn lenient_base64() -> base64::engine::GeneralPurpose {
    base64::engine::GeneralPurpose::new(
        &base64::alphabet::STANDARD,
        base64::engine::GeneralPurposeConfig::new()
            .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent)
            .with_decode_allow_trailing_bits(true),
    )
}

/// WeCom-App `agentId`.
pub fn validate_agent_id(value: &serde_json::Value) -> Result<i64, ValidationError> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().filter(|v| *v > 0).ok_or(ValidationError::AgentId),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or(ValidationError::AgentId),
        _ => Err(ValidationError::AgentId),
    }
}
