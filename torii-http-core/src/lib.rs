//! Protocol cores for the torii server.
//!
//! Three codecs share one buffer discipline: the HTTP/1.x parser that
//! drives the upgrade decision (plain, h2c, WebSocket), the HTTP/2
//! engine (framing, HPACK, per-stream state machine, priority-weighted
//! response scheduling), and the FastCGI record codec. Everything here
//! is synchronous between suspension points; bytes arrive in and leave
//! through [`torii_core::IoBuffer`]s owned by the connection.

pub mod body;
pub mod dispatch;
pub mod fastcgi;
pub mod h2;
pub mod proto;

pub use self::body::BodySource;
pub use self::dispatch::MessageDispatcher;
