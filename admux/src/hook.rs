//! Peer-initiated stream admission.

use async_trait::async_trait;

use crate::socket::Socket;

/// Decision callback for peer-initiated streams.
///
/// The dispatcher invokes the hook once per inbound `OPEN`, before
/// replying on the wire. Calling [`IncomingSocket::accept`] claims the
/// stream; returning without accepting refuses it and nothing is retained.
///
/// The hook runs on the dispatcher's inbound task: while it is awaiting,
/// no further inbound packets are processed.
#[async_trait]
pub trait SocketHook: Send + Sync {
    async fn on_open(&self, event: &mut IncomingSocket);
}

/// A peer-initiated stream offered to the [`SocketHook`].
pub struct IncomingSocket {
    service: String,
    socket: Option<Socket>,
    handled: bool,
}

impl IncomingSocket {
    pub(crate) fn new(service: String, socket: Socket) -> Self {
        Self {
            service,
            socket: Some(socket),
            handled: false,
        }
    }

    /// Service string the peer asked for, without the wire NUL.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Claim the stream. The dispatcher will insert it into the stream
    /// table and acknowledge the open.
    ///
    /// # Panics
    ///
    /// Panics if called twice for the same event.
    pub fn accept(&mut self) -> Socket {
        self.handled = true;
        self.socket.take().expect("incoming stream already accepted")
    }

    pub(crate) fn handled(&self) -> bool {
        self.handled
    }
}

/// Default hook: refuses every peer-initiated stream.
pub struct RejectAll;

#[async_trait]
impl SocketHook for RejectAll {
    async fn on_open(&self, _event: &mut IncomingSocket) {}
}
