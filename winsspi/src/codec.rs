//! Base64 at the wire boundary. Tokens travel as strings; everything past
//! this module works on raw bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::Result;

/// Standard alphabet, padded, no line wrapping.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// The empty string decodes to an empty token.
pub fn decode(token: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(token)?)
}
