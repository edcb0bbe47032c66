//! torii: a multi-protocol static web server core.
//!
//! One TCP listener speaks HTTP/1.1, HTTP/2 (h2c upgrade and ALPN over
//! TLS) and WebSocket. The member crates split along the seams:
//!
//! - [`torii_core`]: pooled buffers, connection lifecycle, timing
//!   wheel, configuration, runtime context;
//! - [`torii_http_core`]: the HTTP/1 codec and upgrade decision, the
//!   HTTP/2 engine (framing, HPACK, stream FSM, weighted scheduling),
//!   FastCGI records;
//! - [`torii_http`]: range/compression negotiation, the tiered file
//!   cache, response serialization, the static file service;
//! - [`torii_ws`]: the WebSocket handshake and masked frame codec;
//! - [`torii_tls`]: the rustls record engine, ALPN, session cache and
//!   ticket keys.
//!
//! This crate re-exports the pieces and provides [`server`], the
//! per-connection drive loop tying them together.

#[doc(inline)]
pub use torii_core as core;
#[doc(inline)]
pub use torii_http as http;
#[doc(inline)]
pub use torii_http_core as http_core;
#[doc(inline)]
pub use torii_tls as tls;
#[doc(inline)]
pub use torii_ws as ws;

pub mod server;

pub use self::server::Server;
