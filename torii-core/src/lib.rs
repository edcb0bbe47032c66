//! Core primitives shared by every torii protocol layer.
//!
//! This crate owns the pieces that sit below any particular protocol:
//! the pooled [`IoBuffer`] with its prependable-headroom discipline, the
//! virtual-memory [`BlockFactory`] backing it, the [`Connection`]
//! lifecycle (active vs. graceful close, TIME-WAIT socket reuse), the
//! coarse [`TimingWheel`] driving deferred reuse, and the
//! [`RuntimeContext`] that replaces process-wide singletons.
//!
//! [`IoBuffer`]: buffer::IoBuffer
//! [`BlockFactory`]: buffer::BlockFactory
//! [`Connection`]: conn::Connection
//! [`TimingWheel`]: timer::TimingWheel
//! [`RuntimeContext`]: context::RuntimeContext

pub mod buffer;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod listener;
pub mod timer;

/// Shutdown management for graceful shutdown of async-first applications.
pub mod graceful {
    #[doc(inline)]
    pub use ::tokio_graceful::{
        Shutdown, ShutdownBuilder, ShutdownGuard, WeakShutdownGuard, default_signal,
    };
}

pub use self::buffer::{Block, BlockFactory, IoBuffer};
pub use self::config::ServerConfig;
pub use self::conn::Connection;
pub use self::context::RuntimeContext;
pub use self::error::CoreError;
pub use self::timer::TimingWheel;
