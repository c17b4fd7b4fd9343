//! Correlation-id handling.
//!
//! Every request carries a correlation id: taken from the first usable
//! client-supplied header, otherwise freshly generated. The id is echoed back
//! on the response and copied onto the outbound upstream request so log lines
//! across the gateway and its upstreams can be joined.

use http::HeaderMap;
use uuid::Uuid;

/// Headers consulted for an inbound correlation id, in priority order.
pub const REQUEST_ID_HEADERS: [&str; 3] = ["x-request-id", "x-correlation-id", "x-trace-id"];

/// Header the id is echoed on (response) and forwarded as (upstream request).
pub const RESPONSE_HEADER: &str = "x-request-id";

/// Client-supplied values longer than this are ignored.
pub const MAX_ID_LEN: usize = 128;

/// Returns the request's correlation id, generating one when absent.
///
/// The first non-empty trimmed value of length ≤ [`MAX_ID_LEN`] among
/// [`REQUEST_ID_HEADERS`] wins; otherwise a fresh UUID is minted.
pub fn extract_or_generate(headers: &HeaderMap) -> String {
    for name in REQUEST_ID_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() && trimmed.len() <= MAX_ID_LEN {
                return trimmed.to_string();
            }
        }
    }
    Uuid::new_v4().to_string()
}
