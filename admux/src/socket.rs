//! Logical stream endpoints.
//!
//! One established stream is a [`Socket`] (application surface) and a
//! [`SocketController`] (dispatcher surface) sharing the same state. The
//! split keeps the two producers disciplined: the dispatcher enqueues
//! inbound data and delivers acknowledgments; the application reads,
//! writes, and closes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::wire::{Command, Packet};

/// Depth of the per-stream read queue.
///
/// One chunk: the inbound loop parks on the second chunk until the reader
/// has taken the first, which is what delays the reciprocating `OKAY`
/// under application backpressure.
const READ_QUEUE_DEPTH: usize = 1;

type BoxedIoFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + Sync>>;

/// State shared between the two stream surfaces.
pub(crate) struct SocketShared {
    local_id: u32,
    remote_id: u32,
    service: String,
    created_locally: bool,
    /// Serializes application writers so at most one `WRTE` is in flight.
    write_turn: tokio::sync::Mutex<()>,
    state: Mutex<SocketState>,
}

struct SocketState {
    /// Set by `close` and by `dispose`; never reverts.
    closed: bool,
    /// Write gate: `None` is ready, `Some` is awaiting the peer's `OKAY`.
    pending_ack: Option<oneshot::Sender<()>>,
    /// Inbound delivery queue; dropped at dispose so readers observe
    /// end-of-stream once drained.
    data_tx: Option<mpsc::Sender<Bytes>>,
}

/// Application-facing handle to one logical stream.
///
/// Reads deliver payload chunks in arrival order and end with `None` once
/// the stream is torn down. Writes complete when the peer has acknowledged
/// the chunk (stop-and-wait). `AsyncRead`/`AsyncWrite` adapters are
/// provided so services can drive the stream with ordinary tokio I/O.
pub struct Socket {
    shared: Arc<SocketShared>,
    packet_tx: mpsc::Sender<Packet>,
    data_rx: mpsc::Receiver<Bytes>,
    max_payload: usize,
    /// Partially-consumed chunk for the `AsyncRead` adapter.
    read_leftover: Option<Bytes>,
    /// In-flight operations for the `AsyncWrite` adapter.
    write_fut: Option<(BoxedIoFuture, usize)>,
    shutdown_fut: Option<BoxedIoFuture>,
}

impl Socket {
    /// Build a connected socket/controller pair for an established stream.
    pub(crate) fn pair(
        local_id: u32,
        remote_id: u32,
        service: String,
        created_locally: bool,
        packet_tx: mpsc::Sender<Packet>,
        max_payload: usize,
    ) -> (Socket, SocketController) {
        let (data_tx, data_rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let shared = Arc::new(SocketShared {
            local_id,
            remote_id,
            service,
            created_locally,
            write_turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(SocketState {
                closed: false,
                pending_ack: None,
                data_tx: Some(data_tx),
            }),
        });
        let socket = Socket {
            shared: shared.clone(),
            packet_tx,
            data_rx,
            max_payload,
            read_leftover: None,
            write_fut: None,
            shutdown_fut: None,
        };
        (socket, SocketController { shared })
    }

    /// Id assigned to this stream by this side.
    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    /// Id assigned to this stream by the peer.
    pub fn remote_id(&self) -> u32 {
        self.shared.remote_id
    }

    /// Service string the stream was opened with.
    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// Whether this side initiated the stream.
    pub fn created_locally(&self) -> bool {
        self.shared.created_locally
    }

    /// Receive the next payload chunk, or `None` at end-of-stream.
    ///
    /// Chunks already queued when the stream closes are still delivered
    /// before the end is signalled.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    /// Send one payload chunk and wait for the peer's acknowledgment.
    ///
    /// Writers are serialized per stream; the next chunk goes on the wire
    /// only after the previous one was acknowledged.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        write_chunk(
            self.shared.clone(),
            self.packet_tx.clone(),
            self.max_payload,
            data,
        )
        .await
    }

    /// Initiate teardown. Idempotent: only the first call emits `CLSE`.
    ///
    /// The stream stays readable until the peer's answering `CLSE`
    /// arrives; further writes fail with [`Error::StreamClosed`].
    pub async fn close(&self) {
        let _ = close_stream(self.shared.clone(), self.packet_tx.clone()).await;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("local_id", &self.shared.local_id)
            .field("remote_id", &self.shared.remote_id)
            .field("service", &self.shared.service)
            .field("created_locally", &self.shared.created_locally)
            .finish()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // An abandoned handle closes the stream so the peer does not keep
        // writing into a queue nobody drains. Best effort: if the outbound
        // queue is full or the dispatcher is gone, teardown is already in
        // motion elsewhere.
        let send_close = {
            let mut state = self.shared.state.lock();
            if state.closed {
                false
            } else {
                state.closed = true;
                true
            }
        };
        if send_close {
            let _ = self.packet_tx.try_send(Packet::empty(
                Command::Close,
                self.shared.local_id,
                self.shared.remote_id,
            ));
        }
    }
}

async fn write_chunk(
    shared: Arc<SocketShared>,
    packet_tx: mpsc::Sender<Packet>,
    max_payload: usize,
    data: Bytes,
) -> Result<()> {
    if data.len() > max_payload {
        return Err(Error::PayloadTooLarge {
            len: data.len(),
            max: max_payload,
        });
    }

    let _turn = shared.write_turn.lock().await;

    let ack_rx = {
        let mut state = shared.state.lock();
        if state.closed {
            return Err(Error::StreamClosed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        state.pending_ack = Some(ack_tx);
        ack_rx
    };

    let packet = Packet::new(Command::Write, shared.local_id, shared.remote_id, data);
    if packet_tx.send(packet).await.is_err() {
        shared.state.lock().pending_ack = None;
        return Err(Error::ConnectionClosed);
    }

    // Wait for the peer's OKAY; dispose drops the sender, failing us.
    ack_rx.await.map_err(|_| Error::StreamClosed)
}

async fn close_stream(shared: Arc<SocketShared>, packet_tx: mpsc::Sender<Packet>) -> Result<()> {
    let send_close = {
        let mut state = shared.state.lock();
        if state.closed {
            false
        } else {
            state.closed = true;
            true
        }
    };
    if send_close {
        debug!(
            "stream ({}, {}): closing locally",
            shared.local_id, shared.remote_id
        );
        packet_tx
            .send(Packet::empty(
                Command::Close,
                shared.local_id,
                shared.remote_id,
            ))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
    }
    Ok(())
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if let Some(chunk) = self.read_leftover.as_mut() {
                let take = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..take]);
                chunk.advance(take);
                if chunk.is_empty() {
                    self.read_leftover = None;
                }
                return Poll::Ready(Ok(()));
            }
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    // Empty chunks must not be surfaced: zero filled bytes
                    // reads as end-of-stream to the caller.
                    if !chunk.is_empty() {
                        self.read_leftover = Some(chunk);
                    }
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_fut.is_none() {
            let fut = write_chunk(
                self.shared.clone(),
                self.packet_tx.clone(),
                self.max_payload,
                Bytes::copy_from_slice(buf),
            );
            self.write_fut = Some((Box::pin(fut), buf.len()));
        }
        let (fut, len) = self.write_fut.as_mut().expect("write future just stored");
        let len = *len;
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.write_fut = None;
                match result {
                    Ok(()) => Poll::Ready(Ok(len)),
                    Err(err) => Poll::Ready(Err(err.into())),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // A completed poll_write already means the peer acknowledged the
        // chunk; there is no further buffer to drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.shutdown_fut.is_none() {
            let fut = close_stream(self.shared.clone(), self.packet_tx.clone());
            self.shutdown_fut = Some(Box::pin(fut));
        }
        let fut = self.shutdown_fut.as_mut().expect("shutdown future just stored");
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.shutdown_fut = None;
                Poll::Ready(result.map_err(Into::into))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Dispatcher-facing handle to one logical stream.
#[derive(Clone)]
pub(crate) struct SocketController {
    shared: Arc<SocketShared>,
}

impl SocketController {
    pub(crate) fn remote_id(&self) -> u32 {
        self.shared.remote_id
    }

    /// Whether teardown has begun on this stream.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Deliver one inbound chunk to the application.
    ///
    /// Completes only once the reader has taken the chunk off the queue;
    /// the return value says whether the reciprocating `OKAY` should still
    /// be sent (the stream may have closed while we were parked).
    pub(crate) async fn enqueue(&self, data: Bytes) -> bool {
        let data_tx = self.shared.state.lock().data_tx.clone();
        let Some(data_tx) = data_tx else {
            return false;
        };
        if data_tx.send(data).await.is_err() {
            // Reader handle dropped; the stream is on its way down.
            return false;
        }
        // With a queue depth of one, fresh capacity means the reader has
        // consumed our chunk. The reservation itself is discarded.
        match data_tx.reserve().await {
            Ok(permit) => drop(permit),
            Err(_) => return false,
        }
        !self.shared.state.lock().closed
    }

    /// Deliver the peer's `OKAY` for the in-flight write, releasing the
    /// write gate.
    pub(crate) fn ack(&self) {
        let pending = self.shared.state.lock().pending_ack.take();
        match pending {
            Some(ack_tx) => {
                let _ = ack_tx.send(());
            }
            None => debug!(
                "stream ({}, {}): acknowledgment with no write in flight",
                self.shared.local_id, self.shared.remote_id
            ),
        }
    }

    /// Forced teardown: end-of-stream to readers once the queue drains,
    /// failure to the pending writer. Idempotent.
    pub(crate) fn dispose(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.data_tx = None;
        if let Some(ack_tx) = state.pending_ack.take() {
            drop(ack_tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pair() -> (Socket, SocketController, mpsc::Receiver<Packet>) {
        let (packet_tx, packet_rx) = mpsc::channel(8);
        let (socket, controller) = Socket::pair(1, 17, "shell:".to_string(), true, packet_tx, 4096);
        (socket, controller, packet_rx)
    }

    #[tokio::test]
    async fn test_enqueue_completes_on_consume() {
        let (mut socket, controller, _packet_rx) = test_pair();

        let pending = controller.enqueue(Bytes::from_static(b"data"));
        tokio::pin!(pending);

        // Nothing consumed yet, so delivery must not complete.
        assert!(still_pending(&mut pending).await);

        assert_eq!(socket.read().await.unwrap(), Bytes::from_static(b"data"));
        assert!(pending.await);
    }

    #[tokio::test]
    async fn test_dispose_ends_reads_and_fails_writer() {
        let (mut socket, controller, mut packet_rx) = test_pair();

        let writer = tokio::spawn({
            let shared = controller.shared.clone();
            let packet_tx = socket.packet_tx.clone();
            async move { write_chunk(shared, packet_tx, 4096, Bytes::from_static(b"A")).await }
        });
        // Let the WRTE reach the outbound queue before tearing down.
        let packet = packet_rx.recv().await.unwrap();
        assert_eq!(packet.command, Command::Write);

        controller.dispose();
        controller.dispose(); // idempotent

        assert!(matches!(writer.await.unwrap(), Err(Error::StreamClosed)));
        assert!(socket.read().await.is_none());
        assert!(controller.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (socket, _controller, mut packet_rx) = test_pair();
        socket.close().await;
        let packet = packet_rx.recv().await.unwrap();
        assert_eq!(packet.command, Command::Close);

        let err = socket.write(Bytes::from_static(b"A")).await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_locally() {
        let (socket, _controller, mut packet_rx) = test_pair();
        let err = socket
            .write(Bytes::from(vec![0u8; 5000]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { len: 5000, .. }));
        // Nothing went on the wire.
        assert!(packet_rx.try_recv().is_err());
    }

    /// Whether the future is still pending after a poll round.
    async fn still_pending<F: Future + Unpin>(fut: &mut F) -> bool {
        tokio::select! {
            biased;
            _ = fut => false,
            _ = tokio::task::yield_now() => true,
        }
    }
}
