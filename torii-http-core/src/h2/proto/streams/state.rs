use crate::h2::frame::Reason;
use crate::h2::proto::Error;

/// Represents the state of an H2 stream
///
/// ```not_rust
///                              +--------+
///                      send PP |        | recv PP
///                     ,--------|  idle  |--------.
///                    /         |        |         \
///                   v          +--------+          v
///            +----------+          |           +----------+
///            |          |          | send H /  |          |
///     ,------| reserved |          | recv H    | reserved |------.
///     |      | (local)  |          |           | (remote) |      |
///     |      +----------+          v           +----------+      |
///     |          |             +--------+             |          |
///     |          |     recv ES |        | send ES     |          |
///     |   send H |     ,-------|  open  |-------.     | recv H   |
///     |          |    /        |        |        \    |          |
///     |          v   v         +--------+         v   v          |
///     |      +----------+          |           +----------+      |
///     |      |   half   |          |           |   half   |      |
///     |      |  closed  |          | send R /  |  closed  |      |
///     |      | (remote) |          | recv R    | (local)  |      |
///     |      +----------+          |           +----------+      |
///     |           |                |                 |           |
///     |           | send ES /      |       recv ES / |           |
///     |           | send R /       v        send R / |           |
///     |           | recv R     +--------+   recv R   |           |
///     | send R /  `----------->|        |<-----------'  send R / |
///     | recv R                 | closed |               recv R   |
///     `----------------------->|        |<----------------------'
///                              +--------+
/// ```
#[derive(Debug, Clone, Default)]
pub(crate) struct State {
    inner: Inner,
}

#[derive(Debug, Clone, Default)]
enum Inner {
    #[default]
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open {
        local: Peer,
        remote: Peer,
    },
    HalfClosedLocal(Peer),
    HalfClosedRemote(Peer),
    Closed(Cause),
}

#[derive(Debug, Copy, Clone, Default)]
enum Peer {
    #[default]
    AwaitingHeaders,
    Streaming,
}

#[derive(Debug, Clone)]
enum Cause {
    EndStream,
    Error(Error),
    RemoteReset(Reason),
}

impl State {
    /// Opens the receive-half of the stream when a HEADERS frame
    /// arrives. Returns true when this is the stream's first opening.
    pub(crate) fn recv_open(&mut self, eos: bool) -> Result<bool, Error> {
        let mut initial = false;

        self.inner = match self.inner {
            Inner::Idle => {
                initial = true;
                if eos {
                    Inner::HalfClosedRemote(Peer::AwaitingHeaders)
                } else {
                    Inner::Open {
                        local: Peer::AwaitingHeaders,
                        remote: Peer::Streaming,
                    }
                }
            }
            Inner::Open {
                local,
                remote: Peer::AwaitingHeaders,
            } => {
                if eos {
                    Inner::HalfClosedRemote(local)
                } else {
                    Inner::Open {
                        local,
                        remote: Peer::Streaming,
                    }
                }
            }
            Inner::HalfClosedLocal(Peer::AwaitingHeaders) => {
                if eos {
                    Inner::Closed(Cause::EndStream)
                } else {
                    Inner::HalfClosedLocal(Peer::Streaming)
                }
            }
            ref state => {
                tracing::debug!(?state, "recv_open in unexpected state");
                return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
            }
        };

        Ok(initial)
    }

    /// The remote side will not send more data (END_STREAM observed).
    pub(crate) fn recv_close(&mut self) -> Result<(), Error> {
        match self.inner {
            Inner::Open { local, .. } => {
                tracing::trace!("recv_close: Open => HalfClosedRemote({:?})", local);
                self.inner = Inner::HalfClosedRemote(local);
                Ok(())
            }
            Inner::HalfClosedLocal(..) => {
                tracing::trace!("recv_close: HalfClosedLocal => Closed");
                self.inner = Inner::Closed(Cause::EndStream);
                Ok(())
            }
            ref state => {
                tracing::debug!(?state, "recv_close in unexpected state");
                Err(Error::library_go_away(Reason::PROTOCOL_ERROR))
            }
        }
    }

    /// The remote explicitly sent a RST_STREAM.
    pub(crate) fn recv_reset(&mut self, reason: Reason) {
        match self.inner {
            Inner::Closed(..) => {}
            ref state => {
                tracing::trace!(?state, ?reason, "recv_reset");
                self.inner = Inner::Closed(Cause::RemoteReset(reason));
            }
        }
    }

    /// Opens the send-half, for the response HEADERS.
    pub(crate) fn send_open(&mut self, eos: bool) -> Result<(), Error> {
        let local = Peer::Streaming;

        self.inner = match self.inner {
            Inner::Open {
                local: Peer::AwaitingHeaders,
                remote,
            } => {
                if eos {
                    Inner::HalfClosedLocal(remote)
                } else {
                    Inner::Open { local, remote }
                }
            }
            Inner::HalfClosedRemote(Peer::AwaitingHeaders) | Inner::ReservedLocal => {
                if eos {
                    Inner::Closed(Cause::EndStream)
                } else {
                    Inner::HalfClosedRemote(local)
                }
            }
            ref state => {
                tracing::debug!(?state, "send_open in unexpected state");
                return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
            }
        };

        Ok(())
    }

    /// The local side sent its final frame.
    pub(crate) fn send_close(&mut self) {
        match self.inner {
            Inner::Open { remote, .. } => {
                tracing::trace!("send_close: Open => HalfClosedLocal({:?})", remote);
                self.inner = Inner::HalfClosedLocal(remote);
            }
            Inner::HalfClosedRemote(..) => {
                tracing::trace!("send_close: HalfClosedRemote => Closed");
                self.inner = Inner::Closed(Cause::EndStream);
            }
            ref state => {
                tracing::debug!(?state, "send_close in unexpected state");
                self.inner = Inner::Closed(Cause::EndStream);
            }
        }
    }

    /// Reserves the stream for a local PUSH_PROMISE.
    pub(crate) fn reserve_local(&mut self) -> Result<(), Error> {
        match self.inner {
            Inner::Idle => {
                self.inner = Inner::ReservedLocal;
                Ok(())
            }
            ref state => {
                tracing::debug!(?state, "reserve_local in unexpected state");
                Err(Error::library_go_away(Reason::PROTOCOL_ERROR))
            }
        }
    }

    /// Handle a connection-level error.
    pub(crate) fn handle_error(&mut self, err: &Error) {
        match self.inner {
            Inner::Closed(..) => {}
            _ => {
                self.inner = Inner::Closed(Cause::Error(err.clone()));
            }
        }
    }

    /// Set the stream state to reset locally.
    pub(crate) fn set_reset(&mut self, reason: Reason) {
        self.inner = Inner::Closed(Cause::Error(Error::library_reset(reason)));
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.inner, Inner::Idle)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.inner, Inner::Closed(..))
    }

    pub(crate) fn is_remote_reset(&self) -> bool {
        matches!(self.inner, Inner::Closed(Cause::RemoteReset(..)))
    }

    /// True when a HEADERS frame is acceptable from the peer.
    pub(crate) fn is_recv_headers(&self) -> bool {
        matches!(
            self.inner,
            Inner::Idle
                | Inner::Open {
                    remote: Peer::AwaitingHeaders,
                    ..
                }
                | Inner::HalfClosedLocal(Peer::AwaitingHeaders)
        )
    }

    /// True when DATA frames are acceptable from the peer.
    pub(crate) fn is_recv_streaming(&self) -> bool {
        matches!(
            self.inner,
            Inner::Open {
                remote: Peer::Streaming,
                ..
            } | Inner::HalfClosedLocal(Peer::Streaming)
        )
    }

    pub(crate) fn is_send_streaming(&self) -> bool {
        matches!(
            self.inner,
            Inner::Open {
                local: Peer::Streaming,
                ..
            } | Inner::HalfClosedRemote(Peer::Streaming)
        )
    }

    /// True once the remote half is done (END_STREAM seen or closed).
    pub(crate) fn is_recv_end_stream(&self) -> bool {
        matches!(
            self.inner,
            Inner::Closed(Cause::EndStream) | Inner::HalfClosedRemote(..)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_lifecycle() {
        let mut state = State::default();
        assert!(state.is_idle());

        // HEADERS with END_STREAM: a bare GET.
        assert!(state.recv_open(true).unwrap());
        assert!(state.is_recv_end_stream());
        assert!(!state.is_closed());

        // Response HEADERS then final DATA.
        state.send_open(false).unwrap();
        assert!(state.is_send_streaming());
        state.send_close();
        assert!(state.is_closed());
    }

    #[test]
    fn post_lifecycle_half_closes_remote_on_end_stream() {
        let mut state = State::default();
        assert!(state.recv_open(false).unwrap());
        assert!(state.is_recv_streaming());

        state.recv_close().unwrap();
        assert!(state.is_recv_end_stream());
        assert!(!state.is_recv_streaming());
    }

    #[test]
    fn headers_on_a_streaming_remote_is_a_protocol_error() {
        let mut state = State::default();
        state.recv_open(false).unwrap();
        let err = state.recv_open(false).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn reset_from_any_state_closes() {
        let mut state = State::default();
        state.recv_open(false).unwrap();
        state.recv_reset(Reason::CANCEL);
        assert!(state.is_closed());
        assert!(state.is_remote_reset());

        // A second reset on a closed stream is a no-op.
        state.recv_reset(Reason::PROTOCOL_ERROR);
        assert!(state.is_remote_reset());
    }

    #[test]
    fn data_before_headers_is_not_recv_streaming() {
        let state = State::default();
        assert!(!state.is_recv_streaming());
        assert!(state.is_recv_headers());
    }

    #[test]
    fn push_promise_reserves_local() {
        let mut state = State::default();
        state.reserve_local().unwrap();
        state.send_open(false).unwrap();
        assert!(state.is_send_streaming());
    }
}
