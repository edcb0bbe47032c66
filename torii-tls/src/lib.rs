//! The torii TLS engine.
//!
//! One rustls server config per process (certificate, ALPN advertising
//! h2 or http/1.1, session cache, ticket keys) and one [`TlsEngine`]
//! per connection bridging the record layer to the same pooled buffers
//! the cleartext path uses: ciphertext in the receive buffer becomes
//! plaintext in place, outgoing plaintext leaves the send buffer as
//! ciphertext records.

mod context;
mod engine;
mod session;

pub use self::context::{TlsContext, TlsError};
pub use self::engine::{AlpnProtocol, TlsEngine};
pub use self::session::{SessionCache, TicketKeys};
