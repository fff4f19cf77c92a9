//! Event driven backend
//!
//! The network stack reports connect completion, send completion and inbound
//! data through an [EventSink] from a context this crate does not control.
//! [EventChannel] turns those events back into the blocking [DoipChannel] contract:
//!
//! * Connect and send completion are single slot signals which the caller waits on with a timeout
//! * Inbound bytes are pushed into a bounded [ByteQueue] which `receive_message` drains
//!
//! If a chunk of inbound data does not fit into the queue it is dropped and
//! counted. The stream position is then unknown, so the next receive discards
//! everything still queued and reports [TransportError::Timeout] rather than
//! splicing bytes of two different messages together.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    channel::{ChannelResult, DoipChannel, TransportError},
    frame::{self, DoipMessage, FrameError, HEADER_SIZE, MAX_FRAME_SIZE},
};

mod queue;
mod stack;

pub use queue::ByteQueue;
pub use stack::*;

/// Default byte queue size, enough for one maximum sized DoIP message
pub const DEFAULT_QUEUE_CAPACITY: usize = MAX_FRAME_SIZE;

/// State shared between the network stack callbacks and the channel.
/// Lives exactly as long as one connection.
#[derive(Debug)]
struct EventShared {
    queue: ByteQueue,
    doorbell: mpsc::SyncSender<()>,
    connect_done: mpsc::SyncSender<ChannelResult<()>>,
    send_done: mpsc::SyncSender<ChannelResult<()>>,
    connected: AtomicBool,
    closed: AtomicBool,
    overrun: AtomicBool,
    dropped: AtomicUsize,
}

/// Callback target handed to a [NetworkStack] for one connection.
///
/// Every method is non-blocking and may be called from any thread
#[derive(Debug, Clone)]
pub struct EventSink {
    shared: Arc<EventShared>,
}

impl EventSink {
    /// Connection attempt finished
    pub fn on_connected(&self, result: ChannelResult<()>) {
        if result.is_ok() {
            self.shared.connected.store(true, Ordering::Release);
        }
        let _ = self.shared.connect_done.try_send(result);
    }

    /// A previously queued send finished
    pub fn on_sent(&self, result: ChannelResult<()>) {
        let _ = self.shared.send_done.try_send(result);
    }

    /// Inbound data arrived
    pub fn on_received(&self, data: &[u8]) {
        if !self.shared.queue.push_all(data) {
            self.shared.dropped.fetch_add(data.len(), Ordering::Relaxed);
            self.shared.overrun.store(true, Ordering::Release);
            log::warn!(
                "Rx queue overrun, dropped {} bytes ({} queued)",
                data.len(),
                self.shared.queue.len()
            );
        }
        let _ = self.shared.doorbell.try_send(());
    }

    /// The peer or the stack ended the connection
    pub fn on_closed(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shared.doorbell.try_send(());
    }
}

/// Receiving halves of the per connection signals. Owned by the channel only
#[derive(Debug)]
struct Connection {
    shared: Arc<EventShared>,
    doorbell: mpsc::Receiver<()>,
    connect_done: mpsc::Receiver<ChannelResult<()>>,
    send_done: mpsc::Receiver<ChannelResult<()>>,
    /// Bytes of a frame that was still incomplete when the last receive timed out
    partial: Vec<u8>,
}

impl Connection {
    fn new(queue_capacity: usize) -> (Self, EventSink) {
        let (doorbell_tx, doorbell_rx) = mpsc::sync_channel(1);
        let (connect_tx, connect_rx) = mpsc::sync_channel(1);
        let (send_tx, send_rx) = mpsc::sync_channel(1);
        let shared = Arc::new(EventShared {
            queue: ByteQueue::new(queue_capacity),
            doorbell: doorbell_tx,
            connect_done: connect_tx,
            send_done: send_tx,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            overrun: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
        });
        let sink = EventSink {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                doorbell: doorbell_rx,
                connect_done: connect_rx,
                send_done: send_rx,
                partial: Vec::new(),
            },
            sink,
        )
    }

    /// Returns true (after discarding the queue) if an overrun was flagged
    fn take_overrun(&mut self) -> bool {
        if self.shared.overrun.swap(false, Ordering::AcqRel) {
            let discarded = self.shared.queue.clear() + self.partial.len();
            self.partial.clear();
            log::warn!("Rx stream desynchronised by overrun, discarded {discarded} queued bytes");
            true
        } else {
            false
        }
    }
}

/// DoIP channel driven by network stack callbacks
#[derive(Debug)]
pub struct EventChannel<S: NetworkStack> {
    stack: S,
    conn: Option<Connection>,
    queue_capacity: usize,
    send_timeout_ms: u32,
}

impl<S: NetworkStack> EventChannel<S> {
    /// Creates a disconnected channel on top of `stack`
    pub fn new(stack: S) -> Self {
        Self {
            stack,
            conn: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout_ms: 10_000,
        }
    }

    /// Sets the Rx byte queue size used for new connections
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = std::cmp::max(HEADER_SIZE, capacity);
        self
    }

    /// Sets how long `send` waits for the stack's send completion
    pub fn with_send_timeout(mut self, send_timeout_ms: u32) -> Self {
        self.send_timeout_ms = send_timeout_ms;
        self
    }

    /// Number of inbound bytes dropped on the current connection because the queue was full
    pub fn dropped_bytes(&self) -> usize {
        self.conn
            .as_ref()
            .map(|c| c.shared.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Access to the underlying network stack
    pub fn stack(&self) -> &S {
        &self.stack
    }

    fn conn(&mut self) -> ChannelResult<&mut Connection> {
        self.conn.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl<S: NetworkStack> DoipChannel for EventChannel<S> {
    fn connect(&mut self, ip: IpAddr, port: u16, timeout_ms: u32) -> ChannelResult<()> {
        self.disconnect();
        let addr = SocketAddr::new(ip, port);
        let (conn, sink) = Connection::new(self.queue_capacity);
        log::debug!("Connecting to {addr} (timeout {timeout_ms}ms)");
        self.stack.connect(addr, sink)?;
        let res = match conn
            .connect_done
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::ConnectFailed(e))) => Err(TransportError::ConnectFailed(e)),
            Ok(Err(e)) => Err(TransportError::ConnectFailed(e.to_string())),
            Err(_) => Err(TransportError::ConnectFailed(format!(
                "{addr}: no connect completion within {timeout_ms}ms"
            ))),
        };
        match res {
            Ok(()) => {
                self.conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                self.stack.close();
                Err(e)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        let timeout = Duration::from_millis(self.send_timeout_ms as u64);
        let conn = self.conn.as_ref().ok_or(TransportError::NotConnected)?;
        if !conn.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.stack.send(data)?;
        let done = self.conn()?.send_done.recv_timeout(timeout);
        match done {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::SendFailed(e))) => Err(TransportError::SendFailed(e)),
            Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
            Err(_) => {
                // Outcome of the write is unknown, a late completion must not
                // be taken as the result of a later send
                log::warn!("No send completion within {}ms, closing connection", self.send_timeout_ms);
                self.disconnect();
                Err(TransportError::Timeout)
            }
        }
    }

    fn receive_message(&mut self, timeout_ms: u32) -> ChannelResult<DoipMessage> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let conn = self.conn()?;
        if conn.take_overrun() {
            return Err(TransportError::Timeout);
        }

        let mut buf = [0u8; MAX_FRAME_SIZE];
        let mut filled = conn.partial.len();
        buf[..filled].copy_from_slice(&conn.partial);
        conn.partial.clear();

        loop {
            let mut needed = HEADER_SIZE;
            if filled >= HEADER_SIZE {
                match frame::decode_header(&buf[..HEADER_SIZE]) {
                    Ok((_, len)) => needed = HEADER_SIZE + len,
                    Err(e) => {
                        // Nothing after a bad header can be trusted
                        conn.shared.queue.clear();
                        return Err(e.into());
                    }
                }
                if filled == needed {
                    let decoded = frame::decode(&buf[..filled])?;
                    log::debug!("DoIP Rx {}: {:02X?}", decoded.message.kind(), decoded.message.data());
                    return Ok(decoded.message);
                }
            }

            let n = conn.shared.queue.pop_into(&mut buf[filled..needed]);
            // Checked after popping, so bytes pushed after a dropped chunk are never used
            if conn.take_overrun() {
                return Err(TransportError::Timeout);
            }
            if n > 0 {
                filled += n;
                continue;
            }

            if conn.shared.closed.load(Ordering::Acquire) && conn.shared.queue.is_empty() {
                if filled == 0 {
                    return Err(TransportError::Closed);
                }
                return Err(FrameError::Truncated { len: filled }.into());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                conn.partial.extend_from_slice(&buf[..filled]);
                return Err(TransportError::Timeout);
            }
            match conn.doorbell.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            self.stack.close();
            log::debug!("Event connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| c.shared.connected.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl<S: NetworkStack> Drop for EventChannel<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
