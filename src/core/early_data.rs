//! Early data carried in `sec-websocket-protocol`
//!
//! Clients may put the first bytes of the tunnel in the subprotocol header,
//! base64url encoded, to save a round trip. Decoding failures are not fatal:
//! the session simply starts without early data.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::Bytes;

use crate::logger::log;

/// URL-safe alphabet, padding optional
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode early data from the subprotocol header value
pub fn decode(header_value: Option<&str>) -> Option<Bytes> {
    let value = header_value?.trim();
    if value.is_empty() {
        return None;
    }

    // Some clients use the standard alphabet
    let normalized: String = value
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();

    match URL_SAFE_LENIENT.decode(normalized.as_bytes()) {
        Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
        Ok(_) => None,
        Err(e) => {
            log::debug!(error = %e, len = value.len(), "Ignoring malformed early data");
            None
        }
    }
}
