use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid channel id length: {0}")]
    InvalidChannelLength(usize),

    #[error("Invalid channel id characters: {0}")]
    InvalidChannelChars(String),

    #[error("Malformed log line: {0}")]
    MalformedLine(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid validation key")]
    InvalidKey,

    #[error("Signed payload is not valid base64")]
    InvalidEncoding,

    #[error("Signed payload is shorter than a signature")]
    Truncated,

    #[error("Signature verification failed")]
    BadSignature,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}
