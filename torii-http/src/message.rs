//! Request/response shapes shared by the serializers.

use std::io::{self, Write as _};
use std::path::Path;

use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version, header};
use tempfile::NamedTempFile;

use torii_http_core::BodySource;
use torii_http_core::body::InMemoryBody;
use torii_http_core::proto::h1::ParsedRequest;

/// Serialization progress of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendState {
    #[default]
    SendHeader,
    SendBody,
}

/// Multipart form-data parse state carried by POST requests.
#[derive(Debug, Clone)]
pub struct MultipartState {
    pub boundary: String,
    pub bytes_seen: u64,
}

/// A request plus the server-side state that rides along with it: the
/// spill file for POST bodies and the multipart boundary, when any.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: u64,
    pub keep_alive: bool,
    body_file: Option<NamedTempFile>,
    body_received: u64,
    multipart: Option<MultipartState>,
}

impl HttpRequest {
    #[must_use]
    pub fn from_parsed(parsed: &ParsedRequest) -> Self {
        let multipart = parsed
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(multipart_boundary)
            .map(|boundary| MultipartState {
                boundary,
                bytes_seen: 0,
            });

        Self {
            method: parsed.method.clone(),
            uri: parsed.uri.clone(),
            version: parsed.version,
            headers: parsed.headers.clone(),
            content_length: parsed.content_length,
            keep_alive: parsed.keep_alive,
            body_file: None,
            body_received: 0,
            multipart,
        }
    }

    #[must_use]
    pub fn multipart(&self) -> Option<&MultipartState> {
        self.multipart.as_ref()
    }

    /// Spills body bytes to the request's temp file, creating it under
    /// `temp_dir` on first write.
    pub fn append_body(&mut self, temp_dir: &Path, bytes: &[u8]) -> io::Result<()> {
        if self.body_file.is_none() {
            self.body_file = Some(tempfile::Builder::new().tempfile_in(temp_dir)?);
        }
        if let Some(file) = self.body_file.as_mut() {
            file.write_all(bytes)?;
        }
        self.body_received += bytes.len() as u64;
        if let Some(multipart) = self.multipart.as_mut() {
            multipart.bytes_seen += bytes.len() as u64;
        }
        Ok(())
    }

    /// True once `Content-Length` bytes of body arrived.
    #[must_use]
    pub fn body_complete(&self) -> bool {
        self.body_received >= self.content_length
    }

    #[must_use]
    pub fn body_file(&self) -> Option<&Path> {
        self.body_file.as_ref().map(NamedTempFile::path)
    }
}

/// Extracts `boundary=` from a `multipart/form-data` content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    if !parts
        .next()?
        .trim()
        .eq_ignore_ascii_case("multipart/form-data")
    {
        return None;
    }
    parts.find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.eq_ignore_ascii_case("boundary")
            .then(|| value.trim_matches('"').to_string())
    })
}

/// A response ready for serialization: status, headers, and the
/// tier-selected body source.
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Box<dyn BodySource>>,
    pub keep_alive: bool,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
            keep_alive: true,
        }
    }

    /// Body length as it will be declared on the wire.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .or_else(|| self.body.as_ref().map(|b| b.len()))
            .unwrap_or(0)
    }

    /// A minimal HTML status page (used for every error status).
    #[must_use]
    pub fn status_page(status: StatusCode, server_name: &str) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1><hr><i>{server_name}</i></body></html>",
            code = status.as_u16(),
        );

        let mut response = Self::new(status);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        set_content_length(&mut response.headers, body.len() as u64);
        response.body = Some(Box::new(InMemoryBody::new(body.into_bytes())));
        response.keep_alive = false;
        response
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_length", &self.content_length())
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

pub(crate) fn set_content_length(headers: &mut HeaderMap, len: u64) {
    let value =
        HeaderValue::from_str(&len.to_string()).unwrap_or(HeaderValue::from_static("0"));
    headers.insert(header::CONTENT_LENGTH, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_boundary_extraction() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=----x123"),
            Some("----x123".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; charset=utf-8; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary("application/json"), None);
    }

    #[test]
    fn post_body_spills_to_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=xyz"),
        );

        let parsed = ParsedRequest {
            method: Method::POST,
            uri: "/upload".parse().unwrap(),
            version: Version::HTTP_11,
            headers,
            content_length: 10,
            keep_alive: true,
            upgrade: torii_http_core::proto::h1::UpgradeIntent::None,
        };
        let mut request = HttpRequest::from_parsed(&parsed);
        assert_eq!(request.multipart().unwrap().boundary, "xyz");

        request.append_body(dir.path(), b"hello").unwrap();
        assert!(!request.body_complete());
        request.append_body(dir.path(), b"world").unwrap();
        assert!(request.body_complete());

        let spilled = std::fs::read(request.body_file().unwrap()).unwrap();
        assert_eq!(spilled, b"helloworld");
        assert!(request.body_file().unwrap().starts_with(dir.path()));
    }

    #[test]
    fn status_pages_carry_html_and_close() {
        let response = Response::status_page(StatusCode::NOT_FOUND, "torii");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.keep_alive);
        assert!(response.content_length() > 0);
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }
}
