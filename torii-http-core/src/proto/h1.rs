//! The HTTP/1.x codec and the upgrade decision.
//!
//! Requests parse incrementally out of the connection's receive buffer:
//! incomplete input leaves the buffer untouched and reports "need
//! more"; a complete head is consumed and classified as plain, h2c, or
//! WebSocket. Response heads serialize straight into the send buffer.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header};

use torii_core::{CoreError, IoBuffer};

/// Hard cap matching the parser's stack allocation.
pub const DEFAULT_MAX_HEADERS: usize = 100;

const MAX_URI_LEN: usize = (u16::MAX - 1) as usize;

/// A malformed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Method,
    Uri,
    UriTooLong,
    Version,
    Header,
    TooManyHeaders,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::Method => "invalid method",
            Self::Uri => "invalid uri",
            Self::UriTooLong => "uri too long",
            Self::Version => "invalid version",
            Self::Header => "invalid header",
            Self::TooManyHeaders => "too many headers",
        };
        write!(f, "malformed request: {what}")
    }
}

impl std::error::Error for ParseError {}

impl From<httparse::Error> for ParseError {
    fn from(src: httparse::Error) -> Self {
        match src {
            httparse::Error::TooManyHeaders => Self::TooManyHeaders,
            httparse::Error::Version => Self::Version,
            httparse::Error::HeaderName | httparse::Error::HeaderValue => Self::Header,
            _ => Self::Header,
        }
    }
}

/// Where the connection goes after this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeIntent {
    /// Stay on HTTP/1.x.
    None,
    /// `Upgrade: h2c` with an `HTTP2-Settings` payload (decoded).
    H2c { settings: Vec<u8> },
    /// RFC 6455 handshake headers are all present.
    WebSocket,
}

#[derive(Debug)]
pub struct ParsedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: u64,
    pub keep_alive: bool,
    pub upgrade: UpgradeIntent,
}

impl ParsedRequest {
    /// Rebuilds the `http` request for the dispatcher.
    pub fn to_http(&self) -> http::Request<()> {
        let mut request = http::Request::new(());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request
    }
}

/// Parses one request head out of `buf`.
///
/// `Ok(None)` means the head is still incomplete; no bytes are
/// consumed. On success the head's bytes (request line through the
/// blank line) are consumed and the body, if any, remains readable.
pub fn parse_request(
    buf: &mut IoBuffer,
    max_headers: usize,
) -> Result<Option<ParsedRequest>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }

    // The httparse borrow of the receive buffer ends with this block;
    // everything extracted below is owned, so the head bytes can be
    // consumed afterwards.
    let (len, method, uri, version, http11, headers) = {
        let mut header_storage =
            vec![httparse::EMPTY_HEADER; max_headers.min(DEFAULT_MAX_HEADERS)];
        let mut parsed = httparse::Request::new(&mut header_storage);

        let bytes = buf.peek();
        tracing::trace!(len = bytes.len(), "parsing request head");
        let len = match parsed.parse(bytes) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::Token) => {
                // Token errors surface for both method and path; blame
                // whichever field never materialized.
                return Err(if parsed.method.is_none() {
                    ParseError::Method
                } else {
                    ParseError::Uri
                });
            }
            Err(err) => return Err(err.into()),
        };

        let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
            .map_err(|_| ParseError::Method)?;
        let path = parsed.path.unwrap_or("/");
        if path.len() > MAX_URI_LEN {
            return Err(ParseError::UriTooLong);
        }
        let uri: Uri = path.parse().map_err(|_| ParseError::Uri)?;
        let (version, http11) = match parsed.version {
            Some(1) => (Version::HTTP_11, true),
            Some(0) => (Version::HTTP_10, false),
            _ => return Err(ParseError::Version),
        };

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for raw in parsed.headers.iter() {
            let name =
                HeaderName::from_bytes(raw.name.as_bytes()).map_err(|_| ParseError::Header)?;
            let value = HeaderValue::from_bytes(raw.value).map_err(|_| ParseError::Header)?;
            headers.append(name, value);
        }

        (len, method, uri, version, http11, headers)
    };

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let keep_alive = if http11 {
        !connection_has_token(&headers, "close")
    } else {
        connection_has_token(&headers, "keep-alive")
    };

    let upgrade = upgrade_intent(&method, &headers);

    buf.retrieve(len);
    Ok(Some(ParsedRequest {
        method,
        uri,
        version,
        headers,
        content_length,
        keep_alive,
        upgrade,
    }))
}

/// True when the `Connection` header carries `token` in its
/// comma-separated list.
fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The upgrade decision driven by the parsed head.
fn upgrade_intent(method: &Method, headers: &HeaderMap) -> UpgradeIntent {
    if !connection_has_token(headers, "upgrade") {
        return UpgradeIntent::None;
    }
    let Some(protocol) = headers.get(header::UPGRADE).and_then(|v| v.to_str().ok()) else {
        return UpgradeIntent::None;
    };

    if protocol.eq_ignore_ascii_case("h2c") {
        let settings = headers
            .get("http2-settings")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| URL_SAFE_NO_PAD.decode(v).ok());
        if let Some(settings) = settings {
            return UpgradeIntent::H2c { settings };
        }
        tracing::debug!("h2c upgrade without a decodable HTTP2-Settings header");
        return UpgradeIntent::None;
    }

    if protocol.eq_ignore_ascii_case("websocket")
        && *method == Method::GET
        && headers.contains_key("sec-websocket-key")
        && headers.contains_key("sec-websocket-version")
    {
        return UpgradeIntent::WebSocket;
    }

    UpgradeIntent::None
}

/// Serializes a response head: status line, headers, blank line.
pub fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    dst: &mut IoBuffer,
) -> Result<(), CoreError> {
    dst.append(b"HTTP/1.1 ")?;
    let mut code = itoa::Buffer::new();
    dst.append(code.format(status.as_u16()).as_bytes())?;
    dst.append(b" ")?;
    dst.append(status.canonical_reason().unwrap_or("Unknown").as_bytes())?;
    dst.append(b"\r\n")?;

    if !headers.contains_key(header::DATE) {
        dst.append(b"date: ")?;
        dst.append(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes())?;
        dst.append(b"\r\n")?;
    }

    for (name, value) in headers {
        dst.append(name.as_str().as_bytes())?;
        dst.append(b": ")?;
        dst.append(value.as_bytes())?;
        dst.append(b"\r\n")?;
    }
    dst.append(b"\r\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use torii_core::BlockFactory;

    fn buffer_with(bytes: &[u8]) -> IoBuffer {
        let factory = BlockFactory::new(64 * 1024, 1).unwrap();
        let mut buf = IoBuffer::new(&factory, 16).unwrap();
        buf.append(bytes).unwrap();
        buf
    }

    #[test]
    fn plain_get_parses_and_consumes_the_head() {
        let mut buf =
            buffer_with(b"GET /index.html HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n");
        let request = parse_request(&mut buf, 64).unwrap().unwrap();

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.uri.path(), "/index.html");
        assert_eq!(request.version, Version::HTTP_11);
        assert!(request.keep_alive);
        assert_eq!(request.upgrade, UpgradeIntent::None);
        assert_eq!(
            request.headers.get(header::ACCEPT_ENCODING).unwrap(),
            "gzip"
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_head_leaves_the_buffer_untouched() {
        let mut buf = buffer_with(b"GET /index.html HTTP/1.1\r\nHost:");
        let before = buf.readable();
        assert!(parse_request(&mut buf, 64).unwrap().is_none());
        assert_eq!(buf.readable(), before);
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let mut buf = buffer_with(b"GET\x01 / HTTP/1.1\r\n\r\n");
        assert!(parse_request(&mut buf, 64).is_err());
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let mut buf = buffer_with(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let request = parse_request(&mut buf, 64).unwrap().unwrap();
        assert!(!request.keep_alive);
    }

    #[test]
    fn h2c_upgrade_detected_with_settings_payload() {
        let mut buf = buffer_with(
            b"GET / HTTP/1.1\r\nConnection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        );
        let request = parse_request(&mut buf, 64).unwrap().unwrap();
        match request.upgrade {
            UpgradeIntent::H2c { settings } => {
                assert_eq!(
                    settings,
                    [0x00, 0x03, 0x00, 0x00, 0x00, 0x64, 0x00, 0x04, 0x00, 0x00, 0xFF, 0xFF]
                );
            }
            other => panic!("expected h2c upgrade, got {other:?}"),
        }
    }

    #[test]
    fn websocket_upgrade_requires_the_handshake_headers() {
        let mut buf = buffer_with(
            b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        let request = parse_request(&mut buf, 64).unwrap().unwrap();
        assert_eq!(request.upgrade, UpgradeIntent::WebSocket);

        // Without the key header the upgrade is ignored.
        let mut buf =
            buffer_with(b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n");
        let request = parse_request(&mut buf, 64).unwrap().unwrap();
        assert_eq!(request.upgrade, UpgradeIntent::None);
    }

    #[test]
    fn post_body_stays_in_the_buffer() {
        let mut buf = buffer_with(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let request = parse_request(&mut buf, 64).unwrap().unwrap();
        assert_eq!(request.content_length, 5);
        assert_eq!(buf.peek(), b"hello");
    }

    #[test]
    fn response_head_serializes_with_status_line_and_date() {
        let factory = BlockFactory::new(64 * 1024, 1).unwrap();
        let mut dst = IoBuffer::new(&factory, 16).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));

        encode_response_head(StatusCode::OK, &headers, &mut dst).unwrap();
        let text = String::from_utf8(dst.read_all()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.to_ascii_lowercase().contains("date: "));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
