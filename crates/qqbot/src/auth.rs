//! Webhook authentication.
//!
//! The platform signs every delivery with Ed25519 over
//! `timestamp + body`, headers `x-signature-ed25519` and
//! `x-signature-timestamp`. Both sides derive the same key pair from the
//! bot secret (repeated to 32 seed bytes), which also answers the op-13
//! URL-validation challenge.

use ed25519_dalek::{Signer, SigningKey, Verifier};

use crate::error::{Error, Result};

/// Derive the Ed25519 seed: the bot secret repeated until 32 bytes.
#[must_use]
pub fn seed_from_secret(secret: &str) -> [u8; 32] {
    let mut seed = [0u8; 32];
    if secret.is_empty() {
        return seed;
    }
    let bytes = secret.as_bytes();
    for (i, slot) in seed.iter_mut().enumerate() {
        *slot = bytes[i % bytes.len()];
    }
    seed
}

#[must_use]
pub fn signing_key(secret: &str) -> SigningKey {
    SigningKey::from_bytes(&seed_from_secret(secret))
}

/// Verify a webhook delivery.
pub fn verify(secret: &str, timestamp: &str, body: &[u8], signature_hex: &str) -> Result<()> {
    let signature_bytes = hex::decode(signature_hex).map_err(|_| Error::Signature)?;
    let signature = ed25519_dalek::Signature::from_slice(&signature_bytes)
        .map_err(|_| Error::Signature)?;

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);

    signing_key(secret)
        .verifying_key()
        .verify(&message, &signature)
        .map_err(|_| Error::Signature)
}

/// Answer the op-13 validation challenge: hex signature over
/// `event_ts + plain_token`.
#[must_use]
pub fn sign_validation(secret: &str, event_ts: &str, plain_token: &str) -> String {
    let message = format!("{event_ts}{plain_token}");
    let signature = signing_key(secret).sign(message.as_bytes());
    hex::encode(signature.to_bytes())
}
