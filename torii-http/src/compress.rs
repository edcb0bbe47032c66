//! Gzip representations, negotiated by content type.

use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use http::{HeaderMap, header};

/// The closed set of types worth compressing. Everything else (images,
/// archives, video) is already entropy-coded.
const COMPRESSIBLE: [&str; 8] = [
    "text/html",
    "text/css",
    "text/plain",
    "text/javascript",
    "application/json",
    "application/xml",
    "application/javascript",
    "application/xhtml+xml",
];

#[must_use]
pub fn is_compressible(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    COMPRESSIBLE.iter().any(|c| essence.eq_ignore_ascii_case(c))
}

/// True when the request advertises gzip support.
#[must_use]
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| {
            let token = token.trim();
            let name = token.split(';').next().unwrap_or(token).trim();
            name.eq_ignore_ascii_case("gzip") || name == "*"
        })
}

/// Gzip-compresses a whole buffer.
pub fn gzip_vec(src: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(src.len() / 2 + 16), Compression::default());
    encoder.write_all(src)?;
    encoder.finish()
}

/// Produces the gzip representation of `src_path` as a read-only temp
/// file under `temp_dir`, returning the representation's path.
///
/// The file persists for the process lifetime; the cache keeps one per
/// (path, compress) key.
pub fn gzip_to_temp_file(src_path: &Path, temp_dir: &Path) -> io::Result<PathBuf> {
    let mut input = std::fs::File::open(src_path)?;
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;

    let mut temp = tempfile::Builder::new()
        .prefix("compress")
        .suffix(".tmp")
        .tempfile_in(temp_dir)?;
    let compressed = gzip_vec(&raw)?;
    temp.write_all(&compressed)?;

    let (_, path) = temp.keep().map_err(|err| err.error)?;
    tracing::debug!(
        src = %src_path.display(),
        dst = %path.display(),
        raw = raw.len(),
        compressed = compressed.len(),
        "wrote gzip representation"
    );
    Ok(path)
}
