//! WebSocket upgrade handshake for connect operations.
use base64::Engine;
use http::{HeaderValue, Response, StatusCode};
use tokio_tungstenite::tungstenite as ws;

use crate::error::UpgradeError;

/// Subprotocols we offer, in preference order.
///
/// v4 delivers a JSON `Status` on the error channel; older servers fall
/// back down the list.
pub(crate) const WS_PROTOCOLS: &str =
    "v4.channel.k8s.io, v3.channel.k8s.io, v2.channel.k8s.io, channel.k8s.io";

const SUPPORTED: [&str; 4] = [
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Generate a random Sec-WebSocket-Key
pub(crate) fn sec_websocket_key() -> String {
    let r: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(r)
}

/// Attach the upgrade headers to a request
pub(crate) fn apply_headers(headers: &mut http::HeaderMap, key: &str) {
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        http::header::SEC_WEBSOCKET_VERSION,
        HeaderValue::from_static("13"),
    );
    if let Ok(value) = HeaderValue::try_from(key) {
        headers.insert(http::header::SEC_WEBSOCKET_KEY, value);
    }
    headers.insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(WS_PROTOCOLS),
    );
}

/// Verify the upgrade response according to RFC 6455 plus subprotocol
/// selection.
pub(crate) fn verify_response<B>(res: &Response<B>, key: &str) -> Result<(), UpgradeError> {
    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(UpgradeError::ProtocolSwitch(res.status()));
    }

    let headers = res.headers();
    if !headers
        .get(http::header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(UpgradeError::MissingUpgradeWebSocketHeader);
    }

    if !headers
        .get(http::header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("Upgrade"))
        .unwrap_or(false)
    {
        return Err(UpgradeError::MissingConnectionUpgradeHeader);
    }

    let accept_key = ws::handshake::derive_accept_key(key.as_bytes());
    if !headers
        .get(http::header::SEC_WEBSOCKET_ACCEPT)
        .map(|h| h == accept_key.as_str())
        .unwrap_or(false)
    {
        return Err(UpgradeError::SecWebSocketAcceptKeyMismatch);
    }

    match headers
        .get(http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
    {
        Some(proto) if SUPPORTED.contains(&proto) => Ok(()),
        _ => Err(UpgradeError::SecWebSocketProtocolMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_response(key: &str, protocol: &str) -> Response<()> {
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::CONNECTION, "Upgrade")
            .header(
                http::header::SEC_WEBSOCKET_ACCEPT,
                ws::handshake::derive_accept_key(key.as_bytes()),
            )
            .header(http::header::SEC_WEBSOCKET_PROTOCOL, protocol)
            .body(())
            .unwrap()
    }

    #[test]
    fn accepts_any_offered_subprotocol() {
        let key = sec_websocket_key();
        for proto in SUPPORTED {
            assert!(verify_response(&upgrade_response(&key, proto), &key).is_ok());
        }
    }

    #[test]
    fn rejects_unknown_subprotocol_and_bad_key() {
        let key = sec_websocket_key();
        assert!(matches!(
            verify_response(&upgrade_response(&key, "v5.channel.k8s.io"), &key),
            Err(UpgradeError::SecWebSocketProtocolMismatch)
        ));
        assert!(matches!(
            verify_response(&upgrade_response(&key, "v4.channel.k8s.io"), "other-key"),
            Err(UpgradeError::SecWebSocketAcceptKeyMismatch)
        ));
    }

    #[test]
    fn rejects_plain_responses() {
        let key = sec_websocket_key();
        let res = Response::builder().status(StatusCode::OK).body(()).unwrap();
        assert!(matches!(
            verify_response(&res, &key),
            Err(UpgradeError::ProtocolSwitch(StatusCode::OK))
        ));
    }
}
