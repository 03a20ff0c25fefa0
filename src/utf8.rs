//! UTF-8 validation for text payloads
//!
//! RFC 6455 requires text messages to be valid UTF-8. Fragmented messages
//! are checked incrementally: every non-final fragment may end in the middle
//! of a multi-byte sequence, which is fine as long as the prefix so far is
//! valid.

/// Validate a complete byte sequence
#[inline]
pub fn validate_utf8(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok()
}

/// Validate a possibly-truncated byte sequence: the bytes must be valid
/// UTF-8 except for an incomplete trailing character
#[inline]
pub fn validate_utf8_partial(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(_) => true,
        // error_len() == None means the input ended inside a sequence
        Err(e) => e.error_len().is_none(),
    }
}
