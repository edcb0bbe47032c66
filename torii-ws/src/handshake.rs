//! The RFC 6455 opening handshake, server side.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderMap, HeaderValue, header};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives `Sec-WebSocket-Accept` from the client's key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// Checks the upgrade request headers; returns the client key when the
/// handshake is acceptable.
#[must_use]
pub fn validate_upgrade(headers: &HeaderMap) -> Option<&str> {
    let has_upgrade_token = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
    if !has_upgrade_token {
        return None;
    }

    let upgrade_is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_is_websocket {
        return None;
    }

    let version_13 = headers
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "13");
    if !version_13 {
        tracing::debug!("websocket upgrade with unsupported version");
        return None;
    }

    headers.get("sec-websocket-key").and_then(|v| v.to_str().ok())
}

/// Header set for the `101 Switching Protocols` answer.
#[must_use]
pub fn handshake_headers(client_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&accept_key(client_key)) {
        headers.insert("sec-websocket-accept", accept);
    }
    headers
}
