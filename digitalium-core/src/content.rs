//! Wire encoding for document content.
//!
//! The `content` column stores a full Yrs snapshot as standard, padded
//! base64. The encoding is byte-exact: `decode(encode(x)) == x`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("content is not valid base64: {0}")]
    InvalidBase64(String),
}

pub fn encode_content(snapshot: &[u8]) -> String {
    STANDARD.encode(snapshot)
}

pub fn decode_content(content: &str) -> Result<Vec<u8>, ContentError> {
    STANDARD
        .decode(content.trim())
        .map_err(|e| ContentError::InvalidBase64(e.to_string()))
}
