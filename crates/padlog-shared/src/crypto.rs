use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::constants::{PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::SignatureError;

fn decode_b64(input: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(input.trim())
        .or_else(|_| URL_SAFE.decode(input.trim()))
        .ok()
}

/// Decode a base64 Ed25519 validation key.
pub fn decode_validate_key(key_b64: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = decode_b64(key_b64).ok_or(SignatureError::InvalidKey)?;
    let bytes: [u8; PUBKEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureError::InvalidKey)
}

/// Verify a signed payload: base64 of `signature (64 bytes) || message`.
///
/// Returns the opened message on success.
pub fn open_signed(signed_b64: &str, key: &VerifyingKey) -> Result<Vec<u8>, SignatureError> {
    let bytes = decode_b64(signed_b64).ok_or(SignatureError::InvalidEncoding)?;
    if bytes.len() < SIGNATURE_SIZE {
        return Err(SignatureError::Truncated);
    }

    let (sig_bytes, message) = bytes.split_at(SIGNATURE_SIZE);
    let signature = Signature::from_slice(sig_bytes).map_err(|_| SignatureError::BadSignature)?;

    key.verify(message, &signature)
        .map_err(|_| SignatureError::BadSignature)?;

    Ok(message.to_vec())
}

/// Convenience wrapper taking the key in its stored base64 form.
pub fn verify_signed_payload(signed_b64: &str, key_b64: &str) -> Result<Vec<u8>, SignatureError> {
    let key = decode_validate_key(key_b64)?;
    open_signed(signed_b64, &key)
}

/// Produce a signed payload in the format accepted by [`open_signed`].
pub fn sign_payload(signing_key: &SigningKey, message: &[u8]) -> String {
    let signature = signing_key.sign(message);
    let mut out = Vec::with_capacity(SIGNATURE_SIZE + message.len());
    out.extend_from_slice(&signature.to_bytes());
    out.extend_from_slice(message);
    STANDARD.encode(out)
}

pub fn encode_validate_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = encode_validate_key(&key.verifying_key());

        let signed = sign_payload(&key, b"hello pad");
        let opened = verify_signed_payload(&signed, &vk).unwrap();
        assert_eq!(opened, b"hello pad");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let vk = encode_validate_key(&other.verifying_key());

        let signed = sign_payload(&key, b"hello pad");
        assert_eq!(
            verify_signed_payload(&signed, &vk),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = encode_validate_key(&key.verifying_key());

        let signed = sign_payload(&key, b"hello pad");
        let mut raw = STANDARD.decode(&signed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = STANDARD.encode(raw);

        assert!(verify_signed_payload(&tampered, &vk).is_err());
    }

    #[test]
    fn test_malformed_inputs() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = encode_validate_key(&key.verifying_key());

        assert_eq!(
            verify_signed_payload("!!!", &vk),
            Err(SignatureError::InvalidEncoding)
        );
        assert_eq!(
            verify_signed_payload(&STANDARD.encode([1u8; 10]), &vk),
            Err(SignatureError::Truncated)
        );
        assert_eq!(
            verify_signed_payload("AAAA", "bm90LWEta2V5"),
            Err(SignatureError::InvalidKey)
        );
    }
}
