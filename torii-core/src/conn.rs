//! Connection lifecycle: buffered transport, close discipline, socket
//! reuse.
//!
//! A [`Connection`] owns one accepted transport endpoint plus one
//! receive and one send [`IoBuffer`]. Operations of the same kind are
//! strictly ordered (the exclusive borrow makes one outstanding recv and
//! one outstanding send the only possibility); close is idempotent.
//!
//! Two close paths exist:
//!
//! - *active close* (locally initiated, including error recovery): the
//!   send buffer is drained, the send side is shut down, and the
//!   connection's accept permit is parked on the timing wheel for the
//!   configured TIME-WAIT interval before it re-arms an accept;
//! - *graceful close* (peer shut down its send side first): pending
//!   sends complete, the send side is shut down, and the permit is
//!   released immediately.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

use crate::buffer::{BlockFactory, IoBuffer, IoOpKind};
use crate::error::CoreError;
use crate::timer::TimingWheel;

/// How many bytes a single receive tries to pull off the socket.
const GOOD_RECV_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// Peer sent FIN; we stop posting receives and drain sends.
    PeerShutdown,
    Closed,
}

/// Which side initiated the close, deciding TIME-WAIT handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Active,
    Graceful,
}

pub struct Connection {
    stream: TcpStream,
    recv_buf: IoBuffer,
    send_buf: IoBuffer,
    state: State,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    /// Promotes an accepted stream into a buffered connection.
    pub fn new(
        stream: TcpStream,
        factory: &BlockFactory,
        headroom: usize,
    ) -> Result<Self, CoreError> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            recv_buf: IoBuffer::new(factory, headroom)?,
            send_buf: IoBuffer::new(factory, headroom)?,
            state: State::Open,
            local_addr,
            peer_addr,
            permit: None,
        })
    }

    /// Attaches the accept-pool permit whose release re-arms an accept.
    pub fn set_permit(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn recv_buf(&mut self) -> &mut IoBuffer {
        &mut self.recv_buf
    }

    pub fn send_buf(&mut self) -> &mut IoBuffer {
        &mut self.send_buf
    }

    /// Both buffers at once, for record layers that transform one into
    /// the other.
    pub fn buffers(&mut self) -> (&mut IoBuffer, &mut IoBuffer) {
        (&mut self.recv_buf, &mut self.send_buf)
    }

    #[must_use]
    pub fn is_peer_shutdown(&self) -> bool {
        self.state == State::PeerShutdown
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Pulls some bytes into the receive buffer.
    ///
    /// Returns the byte count; zero means the peer shut down its send
    /// side, which flips the connection into the graceful-close path.
    pub async fn receive_some(&mut self) -> Result<usize, CoreError> {
        if self.state == State::Closed {
            return Err(CoreError::ConnectionClosed);
        }
        self.recv_buf.make_writeable_space(GOOD_RECV_SIZE)?;
        self.recv_buf.set_last_op(IoOpKind::Receive);

        let n = self.stream.read(self.recv_buf.write_slice()).await?;
        self.recv_buf.advance_write(n);
        self.recv_buf.complete();

        if n == 0 {
            tracing::trace!(peer = %self.peer_addr, "peer shut down send side");
            self.state = State::PeerShutdown;
        }
        Ok(n)
    }

    /// Drains the send buffer onto the socket.
    ///
    /// Partial kernel writes advance the readable region and repost;
    /// the call returns once the buffer is empty.
    pub async fn send_async(&mut self) -> Result<(), CoreError> {
        if self.state == State::Closed {
            return Err(CoreError::ConnectionClosed);
        }
        self.send_buf.set_last_op(IoOpKind::Send);
        while !self.send_buf.is_empty() {
            let n = self.stream.write(self.send_buf.peek()).await?;
            if n == 0 {
                return Err(CoreError::Io(
                    std::io::ErrorKind::WriteZero,
                    Some("socket accepted no bytes".into()),
                ));
            }
            self.send_buf.retrieve(n);
        }
        self.stream.flush().await?;
        self.send_buf.complete();
        Ok(())
    }

    /// Closes the connection, releasing the accept permit per the close
    /// discipline. Safe to call more than once; later calls are no-ops.
    pub async fn close(&mut self, kind: CloseKind, wheel: &TimingWheel, time_wait_secs: u32) {
        if self.state == State::Closed {
            return;
        }

        // Best effort: let queued response bytes drain before FIN. An
        // error here means the peer is gone, which the reset path below
        // already covers.
        if !self.send_buf.is_empty() && self.send_async().await.is_err() {
            self.send_buf.reset();
        }
        if let Err(err) = self.stream.shutdown().await {
            tracing::trace!(peer = %self.peer_addr, "shutdown on closed socket: {err}");
        }
        self.state = State::Closed;
        self.recv_buf.set_last_op(IoOpKind::Disconnect);
        self.recv_buf.complete();

        match (kind, self.permit.take()) {
            (CloseKind::Active, Some(permit)) => {
                // Hold the slot through TIME-WAIT so the freed socket is
                // not immediately re-accepted.
                tracing::trace!(
                    peer = %self.peer_addr,
                    delay_secs = time_wait_secs,
                    "scheduling socket reuse"
                );
                let mut slot = Some(permit);
                wheel.add(time_wait_secs, true, move || {
                    drop(slot.take());
                });
            }
            (CloseKind::Graceful, Some(permit)) => drop(permit),
            (_, None) => {}
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_addr)
            .field("state", &self.state)
            .field("recv_readable", &self.recv_buf.readable())
            .field("send_readable", &self.send_buf.readable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BlockFactory;
    use crate::timer::TimingWheel;

    use std::sync::Arc;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let factory = BlockFactory::new(16 * 1024, 4).unwrap();
        (Connection::new(server, &factory, 16).unwrap(), client)
    }

    #[tokio::test]
    async fn receive_accumulates_in_the_buffer() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"GET / ").await.unwrap();
        client.write_all(b"HTTP/1.1\r\n").await.unwrap();

        let mut seen = 0;
        while seen < 16 {
            seen += conn.receive_some().await.unwrap();
        }
        assert_eq!(conn.recv_buf().peek(), b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn zero_length_receive_flags_peer_shutdown() {
        let (mut conn, client) = pair().await;
        drop(client);

        let n = conn.receive_some().await.unwrap();
        assert_eq!(n, 0);
        assert!(conn.is_peer_shutdown());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_defers_the_permit() {
        let (mut conn, _client) = pair().await;
        let sem = Arc::new(Semaphore::new(1));
        let permit = sem.clone().try_acquire_owned().unwrap();
        conn.set_permit(permit);

        let wheel = TimingWheel::new(1, 4);
        conn.close(CloseKind::Active, &wheel, 2).await;
        assert!(conn.is_closed());
        // Permit is parked on the wheel, not yet released.
        assert_eq!(sem.available_permits(), 0);

        // Second close is a no-op.
        conn.close(CloseKind::Active, &wheel, 2).await;

        wheel.tick();
        wheel.tick();
        wheel.tick();
        assert_eq!(sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn graceful_close_releases_the_permit_immediately() {
        let (mut conn, client) = pair().await;
        let sem = Arc::new(Semaphore::new(1));
        conn.set_permit(sem.clone().try_acquire_owned().unwrap());
        drop(client);
        conn.receive_some().await.unwrap();
        assert!(conn.is_peer_shutdown());

        let wheel = TimingWheel::new(1, 4);
        conn.close(CloseKind::Graceful, &wheel, 240).await;
        assert_eq!(sem.available_permits(), 1);
    }
}
