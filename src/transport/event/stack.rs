//! Network stack interface consumed by the event backend, and a thread based implementation

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use crate::channel::{ChannelResult, TransportError};

use super::EventSink;

/// Asynchronous TCP primitives of a network stack.
///
/// None of these calls wait for completion. Results are reported later through
/// the [EventSink] given to [NetworkStack::connect], from whatever context the
/// stack runs its callbacks in.
pub trait NetworkStack: Send {
    /// Starts connecting to `addr`. Completion is reported through [EventSink::on_connected],
    /// inbound data through [EventSink::on_received]
    fn connect(&mut self, addr: SocketAddr, sink: EventSink) -> ChannelResult<()>;
    /// Queues `data` for transmission. Completion is reported through [EventSink::on_sent]
    fn send(&mut self, data: &[u8]) -> ChannelResult<()>;
    /// Aborts the current connection, if any
    fn close(&mut self);
}

/// Upper bound for a connection attempt inside the stack itself
const STACK_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Size of a single inbound data event
const DEFAULT_RX_CHUNK: usize = 512;

#[derive(Debug)]
struct StackConnection {
    stream: Arc<Mutex<Option<TcpStream>>>,
    aborted: Arc<AtomicBool>,
    tx_queue: mpsc::Sender<Vec<u8>>,
}

/// [NetworkStack] backed by std sockets.
///
/// A connect thread establishes the socket and then turns into the Rx thread,
/// while a second thread drains the Tx queue. Both report through the
/// [EventSink], which makes them the callback context from the channel's view.
#[derive(Debug)]
pub struct ThreadedTcpStack {
    conn: Option<StackConnection>,
    rx_chunk: usize,
}

impl Default for ThreadedTcpStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedTcpStack {
    /// Creates a new stack with no open connection
    pub fn new() -> Self {
        Self {
            conn: None,
            rx_chunk: DEFAULT_RX_CHUNK,
        }
    }

    /// Sets the maximum number of bytes delivered per [EventSink::on_received] call
    pub fn with_rx_chunk(mut self, rx_chunk: usize) -> Self {
        self.rx_chunk = std::cmp::max(1, rx_chunk);
        self
    }
}

impl NetworkStack for ThreadedTcpStack {
    fn connect(&mut self, addr: SocketAddr, sink: EventSink) -> ChannelResult<()> {
        self.close();
        let stream_slot: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let (tx_queue, tx_rx) = mpsc::channel::<Vec<u8>>();
        let aborted = Arc::new(AtomicBool::new(false));
        let slot = stream_slot.clone();
        let aborted_c = aborted.clone();
        let rx_chunk = self.rx_chunk;

        std::thread::Builder::new()
            .name("doip-stack-rx".into())
            .spawn(move || {
                let stream = match TcpStream::connect_timeout(&addr, STACK_CONNECT_TIMEOUT) {
                    Ok(s) => s,
                    Err(e) => {
                        sink.on_connected(Err(TransportError::ConnectFailed(format!("{addr}: {e}"))));
                        return;
                    }
                };
                let _ = stream.set_nodelay(true);
                let (mut reader, writer) = match (stream.try_clone(), stream.try_clone()) {
                    (Ok(r), Ok(w)) => (r, w),
                    (Err(e), _) | (_, Err(e)) => {
                        sink.on_connected(Err(TransportError::ConnectFailed(e.to_string())));
                        return;
                    }
                };
                // Keep one handle where close() can reach it
                match slot.lock() {
                    Ok(mut s) => *s = Some(stream),
                    Err(p) => *p.into_inner() = Some(stream),
                }
                if aborted_c.load(Ordering::SeqCst) {
                    // close() ran while we were still connecting
                    if let Some(s) = take_stream(&slot) {
                        let _ = s.shutdown(Shutdown::Both);
                    }
                    return;
                }

                let tx_sink = sink.clone();
                let tx_thread = std::thread::Builder::new()
                    .name("doip-stack-tx".into())
                    .spawn(move || {
                        let mut writer = writer;
                        while let Ok(data) = tx_rx.recv() {
                            let res = writer
                                .write_all(&data)
                                .map_err(|e| TransportError::SendFailed(e.to_string()));
                            tx_sink.on_sent(res);
                        }
                    });
                if let Err(e) = tx_thread {
                    sink.on_connected(Err(TransportError::ConnectFailed(e.to_string())));
                    return;
                }

                sink.on_connected(Ok(()));
                let mut buf = vec![0u8; rx_chunk];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => sink.on_received(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log::debug!("Stack Rx ended: {e}");
                            break;
                        }
                    }
                }
                sink.on_closed();
            })?;

        self.conn = Some(StackConnection {
            stream: stream_slot,
            aborted,
            tx_queue,
        });
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        let conn = self.conn.as_ref().ok_or(TransportError::NotConnected)?;
        conn.tx_queue
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.aborted.store(true, Ordering::SeqCst);
            if let Some(s) = take_stream(&conn.stream) {
                let _ = s.shutdown(Shutdown::Both);
            }
            // Dropping the Tx queue ends the Tx thread
        }
    }
}

fn take_stream(slot: &Mutex<Option<TcpStream>>) -> Option<TcpStream> {
    match slot.lock() {
        Ok(mut s) => s.take(),
        Err(p) => p.into_inner().take(),
    }
}

impl Drop for ThreadedTcpStack {
    fn drop(&mut self) {
        self.close();
    }
}
