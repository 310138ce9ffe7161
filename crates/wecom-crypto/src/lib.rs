//! WeCom-family callback crypto.
//!
//! Signature: `sha1(sort([token, timestamp, nonce, encrypt]).join(""))`,
//! compared case-insensitively in constant time.
//!
//! Payloads are AES-256-CBC. The key is `base64(encodingAESKey + "=")`
//! (43 chars padded to 44) and the IV is the first 16 key bytes. PKCS#7
//! uses block size 32, so the cipher runs unpadded and the pad is handled
//! here. Plaintext frame:
//! `[16 random bytes | u32-BE msgLen | msgLen bytes | receiveId]`.

use {
    aes::cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit, block_padding::NoPadding},
    base64::Engine,
    rand::Rng,
    sha1::{Digest, Sha1},
};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// WeCom pads to 32-byte blocks even though AES blocks are 16 bytes.
const PAD_BLOCK: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("encodingAESKey does not decode to a 32-byte key")]
    KeyInvalid,

    #[error("callback signature mismatch")]
    SignatureMismatch,

    #[error("ciphertext is not valid base64")]
    CiphertextEncoding,

    #[error("bad PKCS#7 padding")]
    BadPadding,

    #[error("decrypted frame is malformed")]
    FrameInvalid,

    #[error("decrypted message is not UTF-8")]
    Utf8,

    #[error("receiveId mismatch: got {got}")]
    ReceiveIdMismatch { got: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decoded AES key; the IV is its first 16 bytes.
#[derive(Clone)]
pub struct AesKey([u8; 32]);

impl AesKey {
    /// Decode a WeCom `encodingAESKey`: 43 base64 chars (an optional
    /// trailing `=` is tolerated) that decode to exactly 32 bytes. The
    /// platform sometimes emits non-canonical trailing bits, so decoding
    /// is lenient about them.
    pub fn decode(encoding_aes_key: &str) -> Result<Self> {
        let compact: String = encoding_aes_key
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let trimmed = compact.trim_end_matches('=');
        if trimmed.len() != 43 {
            return Err(Error::KeyInvalid);
        }
        let bytes = lenient_engine()
            .decode(format!("{trimmed}="))
            .map_err(|_| Error::KeyInvalid)?;
        let key = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Error::KeyInvalid)?;
        Ok(Self(key))
    }

    fn iv(&self) -> &[u8] {
        &self.0[..16]
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey([REDACTED])")
    }
}

fn lenient_engine() -> base64::engine::GeneralPurpose {
    base64::engine::GeneralPurpose::new(
        &base64::alphabet::STANDARD,
        base64::engine::GeneralPurposeConfig::new()
            .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent)
            .with_decode_allow_trailing_bits(true),
    )
}

/// `sha1` of the sorted concatenation of the four callback parameters.
#[must_use]
pub fn compute_signature(token: &str, timestamp: &str, nonce: &str, encrypted: &str) -> String {
    let mut parts = [token, timestamp, nonce, encrypted];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    hasher.update(parts.concat().as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a callback signature (case-insensitive, constant time).
pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    encrypted: &str,
    expected: &str,
) -> Result<()> {
    let computed = compute_signature(token, timestamp, nonce, encrypted);
    if constant_time_eq(&computed, &expected.to_ascii_lowercase()) {
        Ok(())
    } else {
        Err(Error::SignatureMismatch)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decrypt a base64 ciphertext to the framed message text. When
/// `expected_receive_id` is set, the frame's trailing receiveId must match.
pub fn decrypt(
    ciphertext_b64: &str,
    key: &AesKey,
    expected_receive_id: Option<&str>,
) -> Result<String> {
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|_| Error::CiphertextEncoding)?;
    let (msg, receive_id) = decrypt_frame(&ciphertext, key)?;
    let msg = String::from_utf8(msg).map_err(|_| Error::Utf8)?;

    if let Some(expected) = expected_receive_id
        && !expected.is_empty()
        && receive_id != expected.as_bytes()
    {
        return Err(Error::ReceiveIdMismatch {
            got: String::from_utf8_lossy(&receive_id).into_owned(),
        });
    }
    Ok(msg)
}

/// Decrypt raw (non-base64) ciphertext and return the framed payload
/// bytes. Used for callback media downloads, which carry binary payloads
/// and no receiveId check.
pub fn decrypt_media(ciphertext: &[u8], key: &AesKey) -> Result<Vec<u8>> {
    let (msg, _receive_id) = decrypt_frame(ciphertext, key)?;
    Ok(msg)
}

fn decrypt_frame(ciphertext: &[u8], key: &AesKey) -> Result<(Vec<u8>, Vec<u8>)> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(Error::BadPadding);
    }
    let Ok(decryptor) = Aes256CbcDec::new_from_slices(&key.0, key.iv()) else {
        return Err(Error::KeyInvalid);
    };
    let mut buf = ciphertext.to_vec();
    let plaintext = decryptor
        .decrypt_padded::<NoPadding>(&mut buf)
        .map_err(|_| Error::BadPadding)?;

    let plaintext = unpad(plaintext)?;
    if plaintext.len() < 20 {
        return Err(Error::FrameInvalid);
    }
    let msg_len =
        u32::from_be_bytes([plaintext[16], plaintext[17], plaintext[18], plaintext[19]]) as usize;
    let msg_end = 20usize.checked_add(msg_len).ok_or(Error::FrameInvalid)?;
    if msg_end > plaintext.len() {
        return Err(Error::FrameInvalid);
    }
    Ok((
        plaintext[20..msg_end].to_vec(),
        plaintext[msg_end..].to_vec(),
    ))
}

fn unpad(plaintext: &[u8]) -> Result<&[u8]> {
    let pad = *plaintext.last().ok_or(Error::BadPadding)? as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > plaintext.len() {
        return Err(Error::BadPadding);
    }
    Ok(&plaintext[..plaintext.len() - pad])
}

/// Encrypt a message the way the platform does: random 16-byte prefix,
/// big-endian length, message, receiveId, PKCS#7 padded to 32 bytes,
/// AES-256-CBC, base64. Used for passive-reply echoes and tests.
pub fn encrypt(plaintext: &str, key: &AesKey, receive_id: &str) -> Result<String> {
    let msg = plaintext.as_bytes();
    let mut frame = Vec::with_capacity(20 + msg.len() + receive_id.len() + PAD_BLOCK);
    let mut random = [0u8; 16];
    rand::rng().fill_bytes(&mut random);
    frame.extend_from_slice(&random);
    frame.extend_from_slice(&(msg.len() as u32).to_be_bytes());
    frame.extend_from_slice(msg);
    frame.extend_from_slice(receive_id.as_bytes());

    let pad = PAD_BLOCK - (frame.len() % PAD_BLOCK);
    frame.extend(std::iter::repeat_n(pad as u8, pad));

    let Ok(encryptor) = Aes256CbcEnc::new_from_slices(&key.0, key.iv()) else {
        return Err(Error::KeyInvalid);
    };
    let len = frame.len();
    let ciphertext = encryptor
        .encrypt_padded::<NoPadding>(&mut frame, len)
        .map_err(|_| Error::BadPadding)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    fn key() -> AesKey {
        let encoded = base64::engine::general_purpose::STANDARD.encode([42u8; 32]);
        AesKey::decode(encoded.trim_end_matches('=')).unwrap()
    }

    #[test]
    fn sha1_known_vector() {
        // sha1("abc") — fixed parameters chosen so the sort is identity.
        let mut hasher = Sha1::new();
        hasher.update(b"abc");
        assert_eq!(
            hex::encode(hasher.finalize()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn signature_sorts_parameters() {
        // Same multiset of parameters in a different order signs the same.
        let a = compute_signature("tok", "100", "nonce", "payload");
        let b = compute_signature("nonce", "tok", "payload", "100");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_verifies_case_insensitively() {
        let sig = compute_signature("tok", "100", "n", "enc").to_ascii_uppercase();
        assert!(verify_signature("tok", "100", "n", "enc", &sig).is_ok());
        assert_eq!(
            verify_signature("tok", "100", "n", "enc", "deadbeef"),
            Err(Error::SignatureMismatch)
        );
    }

    #[rstest]
    #[case(42, false)]
    #[case(43, true)]
    #[case(44, false)]
    fn key_must_be_43_chars(#[case] len: usize, #[case] ok: bool) {
        // 'A' repeated decodes fine at 43+1 chars; other lengths fail.
        let key = "A".repeat(len);
        assert_eq!(AesKey::decode(&key).is_ok(), ok, "len={len}");
    }

    #[test]
    fn key_with_trailing_equals_is_equivalent() {
        let raw = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let without = raw.trim_end_matches('=');
        assert!(AesKey::decode(without).is_ok());
        assert!(AesKey::decode(&format!("{without}=")).is_ok());
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = key();
        let cipher = encrypt("<xml><MsgType>text</MsgType></xml>", &key, "corp1").unwrap();
        let plain = decrypt(&cipher, &key, Some("corp1")).unwrap();
        assert_eq!(plain, "<xml><MsgType>text</MsgType></xml>");
    }

    #[test]
    fn receive_id_is_enforced_when_configured() {
        let key = key();
        let cipher = encrypt("hi", &key, "corp1").unwrap();
        assert!(matches!(
            decrypt(&cipher, &key, Some("other-corp")),
            Err(Error::ReceiveIdMismatch { .. })
        ));
        // No configured receiveId skips the check.
        assert_eq!(decrypt(&cipher, &key, None).unwrap(), "hi");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key();
        let cipher = encrypt("hello", &key, "corp1").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(&cipher).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(&raw);
        assert!(decrypt(&tampered, &key, Some("corp1")).is_err());
    }

    #[test]
    fn media_decrypt_returns_payload_bytes() {
        let key = key();
        // Media payloads are the same frame over raw bytes.
        let cipher = encrypt("binary-ish payload", &key, "corp1").unwrap();
        let raw = base64::engine::general_purpose::STANDARD.decode(&cipher).unwrap();
        let payload = decrypt_media(&raw, &key).unwrap();
        assert_eq!(payload, b"binary-ish payload");
    }

    #[test]
    fn unicode_survives_the_frame() {
        let key = key();
        let cipher = encrypt("你好，世界 🦀", &key, "corp1").unwrap();
        assert_eq!(decrypt(&cipher, &key, Some("corp1")).unwrap(), "你好，世界 🦀");
    }

    #[test]
    fn pad_block_is_32() {
        let key = key();
        // A 12-byte frame body still pads to a multiple of 32.
        let cipher = encrypt("x", &key, "c").unwrap();
        let raw = base64::engine::general_purpose::STANDARD.decode(cipher).unwrap();
        assert_eq!(raw.len() % 32, 0);
    }
}
