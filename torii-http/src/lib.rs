//! The torii response pipeline.
//!
//! Turns a parsed request into bytes on the wire: byte-range
//! negotiation, gzip representations negotiated by content type, a
//! three-tier file reader (in-memory cache / memory-mapped /
//! sequential) selected by file size and buffer width, and the
//! serializers that lay responses into send buffers for HTTP/1 and
//! HTTP/2.

pub mod compress;
pub mod file_cache;
pub mod message;
pub mod pipeline;
pub mod range;
pub mod service;

pub use self::file_cache::{FileCache, FileReader, PooledReader};
pub use self::message::{HttpRequest, Response, SendState};
pub use self::pipeline::H1Serializer;
pub use self::service::StaticFileService;
