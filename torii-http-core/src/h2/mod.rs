//! The HTTP/2 engine: wire framing, HPACK, and the per-stream state
//! machine with its priority-weighted response scheduler.

pub mod frame;
pub mod hpack;
pub mod proto;

pub use self::frame::Reason;
pub use self::proto::{Http2Connection, PeerMessage};
