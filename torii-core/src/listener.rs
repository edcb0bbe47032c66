//! The accept pool.
//!
//! A bounded semaphore stands in for the pre-posted accept set: up to
//! `maxUserConnection` connections may be live, `initialUserConnection`
//! sizes the kernel backlog, and a permit released by a closing
//! connection (immediately, or after TIME-WAIT via the timing wheel)
//! re-arms the next accept.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerConfig;

#[derive(Debug)]
pub struct AcceptPool {
    listener: TcpListener,
    permits: Arc<Semaphore>,
    local_addr: SocketAddr,
}

impl AcceptPool {
    /// Binds the listener with the configured pool sizing.
    pub fn bind(config: &ServerConfig) -> std::io::Result<Self> {
        let addr = config.listen_addr()?;
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_tcp_nodelay(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.initial_user_connection.max(1) as i32)?;
        socket.set_nonblocking(true)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(
            %local_addr,
            initial = config.initial_user_connection,
            max = config.max_user_connection,
            "accept pool listening"
        );

        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(config.max_user_connection.max(1) as usize)),
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections that may still be admitted right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free slot, then accepts one connection.
    ///
    /// The returned permit must ride with the connection; dropping it
    /// (or parking it on the reuse wheel) is what re-arms this accept.
    pub async fn accept(
        &self,
    ) -> std::io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| std::io::Error::other("accept pool closed"))?;
        let (stream, peer) = self.listener.accept().await?;
        tracing::trace!(%peer, "accepted connection");
        Ok((stream, peer, permit))
    }
}
