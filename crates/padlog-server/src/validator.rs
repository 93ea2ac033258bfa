//! Signature verification hook for incoming channel messages.

use async_trait::async_trait;
use padlog_shared::crypto::verify_signed_payload;
use padlog_shared::protocol::signed_payload;
use padlog_shared::{LogMessage, SignatureError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Signature check failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("Verification task failed")]
    TaskFailed,
}

/// Checks a message against the channel's validation key.
#[async_trait]
pub trait MessageValidator: Send + Sync {
    async fn validate(&self, message: &LogMessage, validate_key: &str)
        -> Result<(), ValidationError>;
}

/// Ed25519 detached-signature validator.
///
/// The payload (after any checkpoint marker) must be base64 of a 64-byte
/// signature followed by the signed content. Verification runs on the
/// blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Validator;

#[async_trait]
impl MessageValidator for Ed25519Validator {
    async fn validate(
        &self,
        message: &LogMessage,
        validate_key: &str,
    ) -> Result<(), ValidationError> {
        let payload = signed_payload(&message.payload).to_string();
        let key = validate_key.to_string();

        tokio::task::spawn_blocking(move || verify_signed_payload(&payload, &key))
            .await
            .map_err(|_| ValidationError::TaskFailed)??;
        Ok(())
    }
}
