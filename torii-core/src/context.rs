//! Process-wide runtime state, passed explicitly.
//!
//! The context replaces singleton access: every constructor that needs
//! configuration, the buffer pool, or the reuse timer receives a
//! reference to one [`RuntimeContext`] built at startup.

use std::sync::Arc;

use crate::buffer::BlockFactory;
use crate::config::ServerConfig;
use crate::timer::TimingWheel;

#[derive(Debug)]
pub struct RuntimeContext {
    config: ServerConfig,
    buffers: BlockFactory,
    wheel: Arc<TimingWheel>,
}

impl RuntimeContext {
    /// Builds the context: one buffer block per direction per connection
    /// plus slack for record-layer scratch, and a timing wheel spanning
    /// the TIME-WAIT interval.
    pub fn new(config: ServerConfig) -> std::io::Result<Self> {
        let blocks = config
            .max_user_connection
            .saturating_mul(2)
            .saturating_add(16);
        let buffers =
            BlockFactory::with_numa_node(config.buffer_size, blocks, config.numa_node)?;
        let wheel = TimingWheel::spanning(config.time_wait_seconds);

        Ok(Self {
            config,
            buffers,
            wheel,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn buffers(&self) -> &BlockFactory {
        &self.buffers
    }

    #[must_use]
    pub fn reuse_wheel(&self) -> &Arc<TimingWheel> {
        &self.wheel
    }
}
