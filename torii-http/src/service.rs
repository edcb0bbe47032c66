//! The static file service.
//!
//! Resolves a request path under the content root, negotiates
//! conditional/range/compression behavior, picks the reader tier
//! through the file cache, and produces a [`Response`] ready for either
//! serializer.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use http::{HeaderMap, HeaderValue, Method, StatusCode, header};

use torii_http_core::BodySource;
use torii_core::IoBuffer;

use crate::compress;
use crate::file_cache::{FileCache, PooledReader};
use crate::message::{Response, set_content_length};
use crate::range::{self, RangeOutcome};

/// A body window over a pooled reader, for ranged responses.
struct RangedBody {
    reader: PooledReader,
    remaining: u64,
    len: u64,
}

impl BodySource for RangedBody {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)> {
        if self.remaining == 0 {
            return Ok((0, true));
        }
        let max = max.min(self.remaining as usize);
        let (n, reader_eof) = self.reader.read(buf, max)?;
        self.remaining -= n as u64;
        Ok((n, self.remaining == 0 || reader_eof))
    }
}

pub struct StaticFileService {
    root: PathBuf,
    index_file: String,
    server_name: String,
    cache: Arc<FileCache>,
}

impl StaticFileService {
    #[must_use]
    pub fn new(
        root: PathBuf,
        index_file: String,
        server_name: String,
        cache: Arc<FileCache>,
    ) -> Self {
        Self {
            root,
            index_file,
            server_name,
            cache,
        }
    }

    /// Produces the response for one request against the content root.
    #[must_use]
    pub fn handle(&self, method: &Method, path: &str, headers: &HeaderMap) -> Response {
        if method != Method::GET && method != Method::HEAD {
            let mut response = Response::status_page(StatusCode::METHOD_NOT_ALLOWED, &self.server_name);
            response
                .headers
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let Some(file_path) = self.resolve(path) else {
            tracing::info!(path, "rejected path outside the content root");
            return self.error(StatusCode::FORBIDDEN);
        };

        let metadata = match std::fs::metadata(&file_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) | Err(_) => {
                tracing::debug!(path = %file_path.display(), "not found");
                return self.error(StatusCode::NOT_FOUND);
            }
        };

        // Conditional GET on the (mtime, size) validator.
        let etag = file_etag(metadata.len(), &metadata);
        if let Some(candidate) = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            && etag_matches(candidate, &etag)
        {
            let mut response = Response::new(StatusCode::NOT_MODIFIED);
            response
                .headers
                .insert(header::ETAG, header_value(&etag));
            return response;
        }

        let mime_type = mime_guess::from_path(&file_path)
            .first_raw()
            .map(HeaderValue::from_static)
            .unwrap_or_else(|| {
                HeaderValue::from_str(mime::APPLICATION_OCTET_STREAM.as_ref())
                    .unwrap_or(HeaderValue::from_static("application/octet-stream"))
            });

        let range_header = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // Compression is skipped for ranged requests; a byte range
        // addresses the identity representation.
        let compressed = range_header.is_none()
            && compress::accepts_gzip(headers)
            && mime_type
                .to_str()
                .is_ok_and(compress::is_compressible);

        let mut reader = match self.cache.get(&file_path, compressed) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(path = %file_path.display(), %err, "file open failed");
                return self.error(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let size = reader.size();

        let mut response = Response::new(StatusCode::OK);
        response.headers.insert(header::CONTENT_TYPE, mime_type);
        response
            .headers
            .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        response.headers.insert(header::ETAG, header_value(&etag));
        if let Ok(server) = HeaderValue::from_str(&self.server_name) {
            response.headers.insert(header::SERVER, server);
        }
        if compressed {
            response
                .headers
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let body_window = match range::negotiate(range_header.as_deref(), size) {
            RangeOutcome::Full => 0..=size.saturating_sub(1),
            RangeOutcome::Partial(window) => {
                response.status = StatusCode::PARTIAL_CONTENT;
                response.headers.insert(
                    header::CONTENT_RANGE,
                    header_value(&range::content_range(&window, size)),
                );
                window
            }
            RangeOutcome::Unsatisfiable => {
                let mut response = self.error(StatusCode::RANGE_NOT_SATISFIABLE);
                response.headers.insert(
                    header::CONTENT_RANGE,
                    header_value(&range::unsatisfied_range(size)),
                );
                return response;
            }
        };

        let body_len = if size == 0 {
            0
        } else {
            body_window.end() - body_window.start() + 1
        };
        set_content_length(&mut response.headers, body_len);

        if method == Method::HEAD {
            return response;
        }

        if *body_window.start() > 0
            && let Err(err) = reader.seek(*body_window.start())
        {
            tracing::warn!(%err, "seek failed");
            return self.error(StatusCode::INTERNAL_SERVER_ERROR);
        }
        response.body = Some(Box::new(RangedBody {
            reader,
            remaining: body_len,
            len: body_len,
        }));
        response
    }

    fn error(&self, status: StatusCode) -> Response {
        Response::status_page(status, &self.server_name)
    }

    /// Maps a request path under the root, refusing traversal and
    /// appending the index file for directory paths.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let raw = path.split(['?', '#']).next().unwrap_or(path);
        let trimmed = raw.trim_start_matches('/');

        let relative = Path::new(trimmed);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return None,
            }
        }

        let mut full = self.root.join(relative);
        if raw.ends_with('/') || trimmed.is_empty() || full.is_dir() {
            full = full.join(&self.index_file);
        }
        Some(full)
    }
}

impl std::fmt::Debug for StaticFileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFileService")
            .field("root", &self.root)
            .field("index_file", &self.index_file)
            .finish()
    }
}

fn file_etag(len: u64, metadata: &std::fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    format!("\"{mtime:x}-{len:x}\"")
}

fn etag_matches(candidate: &str, etag: &str) -> bool {
    candidate == "*" || candidate.split(',').any(|t| t.trim() == etag)
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or(HeaderValue::from_static(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use torii_core::BlockFactory;

    fn service(root: &Path) -> StaticFileService {
        StaticFileService::new(
            root.to_path_buf(),
            "index.html".into(),
            "torii-test".into(),
            Arc::new(FileCache::new(128 * 1024, root.to_path_buf())),
        )
    }

    fn drain(response: &mut Response) -> Vec<u8> {
        let factory = BlockFactory::new(512 * 1024, 1).unwrap();
        let mut buf = IoBuffer::new(&factory, 16).unwrap();
        let mut out = Vec::new();
        let Some(body) = response.body.as_mut() else {
            return out;
        };
        loop {
            let (_, eof) = body.read_chunk(&mut buf, 8192).unwrap();
            out.extend_from_slice(buf.peek());
            buf.reset();
            if eof {
                return out;
            }
        }
    }

    fn get(service: &StaticFileService, path: &str, headers: &HeaderMap) -> Response {
        service.handle(&Method::GET, path, headers)
    }

    #[test]
    fn cached_html_is_served_gzipped_when_negotiated() {
        let dir = tempfile::tempdir().unwrap();
        let content = "<html>".to_string() + &"x".repeat(488) + "</html>";
        std::fs::write(dir.path().join("index.html"), &content).unwrap();
        let service = service(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let mut response = get(&service, "/index.html", &headers);

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.headers.get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        let body = drain(&mut response);
        assert_eq!(
            body.len() as u64,
            response.content_length(),
        );

        use std::io::Read as _;
        let mut unpacked = Vec::new();
        flate2::read::GzDecoder::new(&body[..])
            .read_to_end(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, content.as_bytes());
    }

    #[test]
    fn ranged_request_on_a_large_binary() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..1_048_576u32).map(|i| i as u8).collect();
        std::fs::write(dir.path().join("large.bin"), &content).unwrap();
        let service = service(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=100-199"));
        let mut response = get(&service, "/large.bin", &headers);

        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers.get(header::CONTENT_RANGE).unwrap(),
            "bytes 100-199/1048576"
        );
        assert_eq!(response.content_length(), 100);
        assert_eq!(drain(&mut response), &content[100..200]);
    }

    #[test]
    fn directory_requests_serve_the_index_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<html>home</html>").unwrap();
        let service = service(dir.path());

        let mut response = get(&service, "/", &HeaderMap::new());
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(drain(&mut response), b"<html>home</html>");
    }

    #[test]
    fn missing_files_get_a_404_page() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let response = get(&service, "/nope.html", &HeaderMap::new());
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.keep_alive);
    }

    #[test]
    fn traversal_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let response = get(&service, "/../etc/passwd", &HeaderMap::new());
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn method_check_precedes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let response = service.handle(&Method::DELETE, "/index.html", &HeaderMap::new());
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers.get(header::ALLOW).unwrap(), "GET, HEAD");
    }

    #[test]
    fn conditional_get_returns_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let service = service(dir.path());

        let first = get(&service, "/a.txt", &HeaderMap::new());
        let etag = first.headers.get(header::ETAG).unwrap().clone();

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, etag);
        let response = get(&service, "/a.txt", &headers);
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert!(response.body.is_none());
    }

    #[test]
    fn unsatisfiable_range_gets_416_with_star_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.bin"), vec![0u8; 100_000]).unwrap();
        let service = service(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=200000-300000"));
        let response = get(&service, "/tiny.bin", &headers);
        assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers.get(header::CONTENT_RANGE).unwrap(),
            "bytes */100000"
        );
    }

    #[test]
    fn head_omits_the_body_but_keeps_the_length() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let service = service(dir.path());

        let response = service.handle(&Method::HEAD, "/a.txt", &HeaderMap::new());
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_length(), 5);
        assert!(response.body.is_none());
    }
}
