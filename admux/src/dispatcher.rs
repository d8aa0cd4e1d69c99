//! The packet dispatcher: protocol state machine over one transport.
//!
//! One inbound task drives packets through the per-command handlers; one
//! writer task exclusively owns the transport write half and drains the
//! outbound queue. The stream and pending-open tables live behind a mutex
//! that is only ever taken for synchronous sections, so every handler
//! observes a consistent snapshot around its suspension points.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hook::{IncomingSocket, SocketHook};
use crate::ids::IdAllocator;
use crate::pending::{PendingOpen, PendingOpens};
use crate::socket::{Socket, SocketController};
use crate::transport;
use crate::wire::{Command, Packet};

/// Depth of the outbound packet queue shared by all streams.
const OUTBOUND_QUEUE_PACKETS: usize = 32;

struct MuxState {
    streams: HashMap<u32, SocketController>,
    pending: PendingOpens,
    ids: IdAllocator,
    disposed: bool,
}

impl MuxState {
    fn new() -> Self {
        Self {
            streams: HashMap::new(),
            pending: PendingOpens::new(),
            ids: IdAllocator::new(),
            disposed: false,
        }
    }

    /// Allocate a local id free in both tables.
    fn allocate_id(&mut self) -> u32 {
        let streams = &self.streams;
        let pending = &self.pending;
        self.ids
            .allocate(|id| streams.contains_key(&id) || pending.contains(id))
    }

    /// Complete a pending open: build the stream under the lock and move
    /// the id from the pending table to the stream table in one step, so
    /// a `WRTE` arriving right behind the `OKAY` already finds its stream.
    fn resolve_open(
        &mut self,
        local_id: u32,
        remote_id: u32,
        packet_tx: &mpsc::Sender<Packet>,
        max_payload: usize,
    ) -> bool {
        let Some(entry) = self.pending.remove(local_id) else {
            return false;
        };
        let (socket, controller) = Socket::pair(
            local_id,
            remote_id,
            entry.service,
            true,
            packet_tx.clone(),
            max_payload,
        );
        self.streams.insert(local_id, controller);
        if entry.tx.send(Ok(socket)).is_err() {
            // The opener gave up waiting; dropping the socket sends CLSE
            // and the entry is reaped when the peer answers.
            debug!("stream {}: opener went away before the peer accepted", local_id);
        }
        true
    }

    /// Fail a pending open with `OpenRejected`.
    fn reject_open(&mut self, local_id: u32) -> bool {
        let Some(entry) = self.pending.remove(local_id) else {
            return false;
        };
        let PendingOpen { service, tx } = entry;
        let _ = tx.send(Err(Error::OpenRejected { service }));
        true
    }
}

struct Shared {
    state: Mutex<MuxState>,
    packet_tx: mpsc::Sender<Packet>,
    config: Config,
    error_tx: mpsc::UnboundedSender<Error>,
    disconnected_tx: watch::Sender<bool>,
    disconnected_rx: watch::Receiver<bool>,
    abort: Mutex<Vec<AbortHandle>>,
}

/// Packet dispatcher and socket multiplexer over one ADB transport.
///
/// Constructed with [`Dispatcher::start`], which takes ownership of the
/// transport halves and runs until the peer disconnects, the transport
/// fails, or [`Dispatcher::dispose`] is called. All three paths resolve
/// [`Dispatcher::disconnected`] after every stream has been torn down.
pub struct Dispatcher {
    shared: Arc<Shared>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl Dispatcher {
    /// Attach a dispatcher to an authenticated transport.
    ///
    /// `reader` and `writer` are the two halves of the framed duplex
    /// channel; `hook` decides the fate of peer-initiated streams (use
    /// [`crate::RejectAll`] to refuse them all).
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails validation.
    pub fn start<R, W>(reader: R, writer: W, config: Config, hook: Arc<dyn SocketHook>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let problems = config.validate();
        if !problems.is_empty() {
            panic!("invalid dispatcher configuration: {}", problems.join(", "));
        }

        let (packet_tx, packet_rx) = mpsc::channel(OUTBOUND_QUEUE_PACKETS);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (disconnected_tx, disconnected_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: Mutex::new(MuxState::new()),
            packet_tx,
            config,
            error_tx,
            disconnected_tx,
            disconnected_rx,
            abort: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(run_writer(writer, packet_rx, shared.clone()));
        let inbound_task = tokio::spawn(run_inbound(reader, shared.clone(), hook));
        shared
            .abort
            .lock()
            .extend([writer_task.abort_handle(), inbound_task.abort_handle()]);

        Self {
            shared,
            errors: Mutex::new(Some(error_rx)),
        }
    }

    /// Open a stream to `service` on the peer.
    ///
    /// Sends `OPEN` and waits for the peer's verdict: `OKAY` yields the
    /// connected [`Socket`], `CLSE` fails with [`Error::OpenRejected`].
    pub async fn open(&self, service: impl Into<String>) -> Result<Socket> {
        let service = service.into();
        let (local_id, open_rx) = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(Error::ConnectionClosed);
            }
            let local_id = state.allocate_id();
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                local_id,
                PendingOpen {
                    service: service.clone(),
                    tx,
                },
            );
            (local_id, rx)
        };

        let mut payload = Vec::with_capacity(service.len() + 1);
        payload.extend_from_slice(service.as_bytes());
        if self.shared.config.append_null_to_service_string {
            payload.push(0);
        }

        debug!("stream {}: opening service {:?}", local_id, service);
        let packet = Packet::new(Command::Open, local_id, 0, Bytes::from(payload));
        if let Err(err) = send_packet(&self.shared, packet).await {
            self.shared.state.lock().pending.remove(local_id);
            return Err(err);
        }

        match open_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Take the error channel. Asynchronous failures (transport loss,
    /// protocol violations) are delivered here; the first caller gets the
    /// receiver, later calls return `None`.
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.lock().take()
    }

    /// Wait until the dispatcher has terminated, for whatever reason.
    /// Completes immediately if it already has.
    pub async fn disconnected(&self) {
        let mut rx = self.shared.disconnected_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Shut the dispatcher down: dispose every stream, fail every pending
    /// operation, stop both transport tasks, resolve
    /// [`Dispatcher::disconnected`]. Idempotent.
    pub fn dispose(&self) {
        dispose_shared(&self.shared);
    }

    /// Whether the dispatcher has terminated.
    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Number of established streams.
    pub fn active_streams(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    /// Number of outbound opens still awaiting the peer's verdict.
    pub fn pending_opens(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

/// Queue a packet for the writer task, enforcing the payload bound.
async fn send_packet(shared: &Shared, packet: Packet) -> Result<()> {
    if packet.payload.len() > shared.config.max_payload_size {
        return Err(Error::PayloadTooLarge {
            len: packet.payload.len(),
            max: shared.config.max_payload_size,
        });
    }
    shared
        .packet_tx
        .send(packet)
        .await
        .map_err(|_| Error::ConnectionClosed)
}

/// Terminate the dispatcher. Idempotent; every stream is closed before
/// the disconnection signal resolves.
fn dispose_shared(shared: &Arc<Shared>) {
    let controllers = {
        let mut state = shared.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.pending.fail_all();
        state.streams.drain().map(|(_, c)| c).collect::<Vec<_>>()
    };
    for controller in &controllers {
        controller.dispose();
    }
    for handle in shared.abort.lock().drain(..) {
        handle.abort();
    }
    let _ = shared.disconnected_tx.send(true);
    debug!("dispatcher disposed, {} streams torn down", controllers.len());
}

/// Writer task: sole owner of the transport write half.
async fn run_writer<W>(mut writer: W, mut packet_rx: mpsc::Receiver<Packet>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(packet) = packet_rx.recv().await {
        if let Err(err) =
            transport::write_packet(&mut writer, &packet, shared.config.calculate_checksum).await
        {
            warn!("outbound transport failed: {}", err);
            let _ = shared.error_tx.send(err);
            break;
        }
    }
    dispose_shared(&shared);
}

/// Inbound task: reads packets until end-of-stream or error, then tears
/// the dispatcher down.
async fn run_inbound<R>(mut reader: R, shared: Arc<Shared>, hook: Arc<dyn SocketHook>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let packet = match transport::read_packet(
            &mut reader,
            shared.config.calculate_checksum,
            shared.config.max_payload_size,
        )
        .await
        {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("transport closed by peer");
                break;
            }
            Err(err) => {
                warn!("inbound transport failed: {}", err);
                let _ = shared.error_tx.send(err);
                break;
            }
        };

        if let Err(err) = handle_packet(&shared, hook.as_ref(), packet).await {
            warn!("inbound handler failed: {}", err);
            let _ = shared.error_tx.send(err);
            break;
        }
    }
    dispose_shared(&shared);
}

async fn handle_packet(shared: &Arc<Shared>, hook: &dyn SocketHook, packet: Packet) -> Result<()> {
    match packet.command {
        Command::Okay => handle_okay(shared, packet).await,
        Command::Close => handle_close(shared, packet).await,
        Command::Write => handle_write(shared, packet).await,
        Command::Open => handle_open(shared, hook, packet).await,
        other => {
            debug!("ignoring {} packet outside the stream layer", other);
            Ok(())
        }
    }
}

/// `OKAY(arg0 = peer id, arg1 = our id)`: either the verdict on a pending
/// open, or the acknowledgment for an in-flight write.
async fn handle_okay(shared: &Arc<Shared>, packet: Packet) -> Result<()> {
    let remote_id = packet.arg0;
    let local_id = packet.arg1;

    enum Verdict {
        Established,
        Acked,
        Violation,
        Stale,
    }

    let verdict = {
        let mut state = shared.state.lock();
        if remote_id == 0 && state.pending.contains(local_id) {
            Verdict::Violation
        } else if state.resolve_open(
            local_id,
            remote_id,
            &shared.packet_tx,
            shared.config.max_payload_size,
        ) {
            Verdict::Established
        } else if let Some(controller) = state.streams.get(&local_id) {
            controller.ack();
            Verdict::Acked
        } else {
            Verdict::Stale
        }
    };

    match verdict {
        Verdict::Established => {
            debug!("stream ({}, {}): open accepted by peer", local_id, remote_id);
        }
        Verdict::Acked => {}
        Verdict::Violation => {
            let message = format!(
                "okay for pending open {} carries a zero remote id",
                local_id
            );
            warn!("{}", message);
            let _ = shared.error_tx.send(Error::Protocol(message));
        }
        Verdict::Stale => {
            // Leftover from a prior connection; tell the peer to forget
            // the stream.
            debug!("okay for unknown stream {}, answering with close", local_id);
            send_packet(shared, Packet::empty(Command::Close, 0, remote_id)).await?;
        }
    }
    Ok(())
}

/// `CLSE(arg0 = peer id or 0, arg1 = our id)`: an open rejection or a
/// stream teardown.
async fn handle_close(shared: &Arc<Shared>, packet: Packet) -> Result<()> {
    let remote_id = packet.arg0;
    let local_id = packet.arg1;

    if remote_id == 0 {
        let rejected = shared.state.lock().reject_open(local_id);
        if rejected {
            debug!("stream {}: open rejected by peer", local_id);
            return Ok(());
        }
        // Historic daemons close established streams with a zero arg0 as
        // well; fall through to the established-stream path.
    }

    let removed = shared.state.lock().streams.remove(&local_id);
    match removed {
        Some(controller) => {
            // Only answer if this side has not already sent its CLSE.
            let reply = !controller.is_closed();
            controller.dispose();
            debug!(
                "stream ({}, {}): closed by peer",
                local_id,
                controller.remote_id()
            );
            if reply {
                send_packet(
                    shared,
                    Packet::empty(Command::Close, local_id, controller.remote_id()),
                )
                .await?;
            }
        }
        None => debug!("close for unknown stream {}, ignoring", local_id),
    }
    Ok(())
}

/// `WRTE(arg0 = peer id, arg1 = our id)`: one payload chunk. The
/// reciprocating `OKAY` is withheld until the application has consumed
/// the chunk, which is the only backpressure signal the peer gets.
async fn handle_write(shared: &Arc<Shared>, packet: Packet) -> Result<()> {
    let local_id = packet.arg1;
    let controller = shared.state.lock().streams.get(&local_id).cloned();
    let Some(controller) = controller else {
        debug!("write for unknown stream {}, ignoring", local_id);
        return Ok(());
    };

    if controller.enqueue(packet.payload).await {
        send_packet(
            shared,
            Packet::empty(Command::Okay, local_id, controller.remote_id()),
        )
        .await?;
    }
    Ok(())
}

/// `OPEN(arg0 = peer id, arg1 = 0, payload = service string)`: a
/// peer-initiated stream, offered to the hook.
async fn handle_open(shared: &Arc<Shared>, hook: &dyn SocketHook, packet: Packet) -> Result<()> {
    let remote_id = packet.arg0;
    if remote_id == 0 {
        let message = "open with a zero sender stream id".to_string();
        warn!("{}", message);
        let _ = shared.error_tx.send(Error::Protocol(message));
        return Ok(());
    }

    // Old daemons send the service string with C string semantics; strip
    // the terminator before handing it to the hook.
    let mut raw = packet.payload.to_vec();
    if raw.last() == Some(&0) {
        raw.pop();
    }
    let service = match String::from_utf8(raw) {
        Ok(service) => service,
        Err(_) => {
            let message = format!(
                "open from peer stream {} with a non-UTF-8 service string",
                remote_id
            );
            warn!("{}", message);
            let _ = shared.error_tx.send(Error::Protocol(message));
            send_packet(shared, Packet::empty(Command::Close, 0, remote_id)).await?;
            return Ok(());
        }
    };

    let local_id = shared.state.lock().allocate_id();
    let (socket, controller) = Socket::pair(
        local_id,
        remote_id,
        service.clone(),
        false,
        shared.packet_tx.clone(),
        shared.config.max_payload_size,
    );

    let mut event = IncomingSocket::new(service, socket);
    hook.on_open(&mut event).await;

    if event.handled() {
        {
            let mut state = shared.state.lock();
            if state.disposed {
                controller.dispose();
                return Ok(());
            }
            state.streams.insert(local_id, controller);
        }
        debug!(
            "stream ({}, {}): accepted incoming open for {:?}",
            local_id,
            remote_id,
            event.service()
        );
        send_packet(shared, Packet::empty(Command::Okay, local_id, remote_id)).await?;
    } else {
        debug!(
            "refusing incoming open from peer stream {} for {:?}",
            remote_id,
            event.service()
        );
        // Marking the stream disposed first keeps the declined socket's
        // drop handler from emitting a spurious CLSE.
        controller.dispose();
        drop(event);
        send_packet(shared, Packet::empty(Command::Close, 0, remote_id)).await?;
    }
    Ok(())
}
