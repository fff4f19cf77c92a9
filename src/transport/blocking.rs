//! Blocking socket backend
//!
//! Uses a non-blocking [TcpStream] which is polled at a fixed interval until
//! either a complete DoIP message was accumulated, or the caller's timeout elapses.

use std::{
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use crate::{
    channel::{ChannelResult, DoipChannel, TransportError},
    frame::{self, DoipMessage, FrameError, HEADER_SIZE, MAX_FRAME_SIZE},
};

/// Default interval between two read attempts
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 10;
/// Default time allowed for a single send
pub const DEFAULT_SEND_TIMEOUT_MS: u32 = 10_000;

/// DoIP channel over a polled TCP socket
#[derive(Debug)]
pub struct BlockingTcpChannel {
    stream: Option<TcpStream>,
    /// Bytes of a frame that was still incomplete when the last receive timed out
    partial: Vec<u8>,
    poll_interval_ms: u32,
    send_timeout_ms: u32,
}

impl Default for BlockingTcpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingTcpChannel {
    /// Creates a disconnected channel with default poll and send timings
    pub fn new() -> Self {
        Self {
            stream: None,
            partial: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }

    /// Sets the sleep between two read attempts
    pub fn with_poll_interval(mut self, poll_interval_ms: u32) -> Self {
        self.poll_interval_ms = std::cmp::max(1, poll_interval_ms);
        self
    }

    /// Sets how long a single send may wait for socket buffer space
    pub fn with_send_timeout(mut self, send_timeout_ms: u32) -> Self {
        self.send_timeout_ms = send_timeout_ms;
        self
    }

    fn stream(&mut self) -> ChannelResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    fn sleep_until(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(std::cmp::min(
            remaining,
            Duration::from_millis(self.poll_interval_ms as u64),
        ));
    }

    /// Payload length declared by `header`. A rejected header discards
    /// everything already waiting on the socket
    fn payload_len(&mut self, header: &[u8]) -> ChannelResult<usize> {
        match frame::decode_header(header) {
            Ok((_, len)) => Ok(len),
            Err(e) => {
                let discarded = self.discard_pending();
                log::warn!("Invalid DoIP header {header:02X?} ({e}), discarded {discarded} pending bytes");
                Err(e.into())
            }
        }
    }

    /// Reads and drops whatever is readable right now
    fn discard_pending(&mut self) -> usize {
        let mut scratch = [0u8; MAX_FRAME_SIZE];
        let mut discarded = 0;
        while let Some(stream) = self.stream.as_mut() {
            match stream.read(&mut scratch) {
                Ok(0) => {
                    self.stream = None;
                }
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        discarded
    }
}

impl DoipChannel for BlockingTcpChannel {
    fn connect(&mut self, ip: IpAddr, port: u16, timeout_ms: u32) -> ChannelResult<()> {
        self.disconnect();
        let addr = SocketAddr::new(ip, port);
        // connect_timeout rejects a zero duration
        let timeout = Duration::from_millis(std::cmp::max(1, timeout_ms) as u64);
        log::debug!("Connecting to {addr} (timeout {timeout_ms}ms)");
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        let deadline = Instant::now() + Duration::from_millis(self.send_timeout_ms as u64);
        let mut written = 0;
        while written < data.len() {
            let res = self.stream()?.write(&data[written..]);
            match res {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::SendFailed(format!(
                            "only {written} of {} bytes written before timeout",
                            data.len()
                        )));
                    }
                    self.sleep_until(deadline);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::SendFailed(e.to_string())),
            }
        }
        Ok(())
    }

    fn receive_message(&mut self, timeout_ms: u32) -> ChannelResult<DoipMessage> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let mut filled = self.partial.len();
        buf[..filled].copy_from_slice(&self.partial);
        self.partial.clear();

        let mut needed = HEADER_SIZE;
        if filled >= HEADER_SIZE {
            needed = HEADER_SIZE + self.payload_len(&buf[..HEADER_SIZE])?;
        }

        loop {
            if filled == needed && filled >= HEADER_SIZE {
                let decoded = frame::decode(&buf[..filled])?;
                log::debug!("DoIP Rx {}: {:02X?}", decoded.message.kind(), decoded.message.data());
                return Ok(decoded.message);
            }
            let res = self.stream()?.read(&mut buf[filled..needed]);
            match res {
                Ok(0) => {
                    self.stream = None;
                    if filled == 0 {
                        log::debug!("Peer closed the connection");
                        return Err(TransportError::Closed);
                    }
                    log::warn!("Peer closed the connection mid frame after {filled} bytes");
                    return Err(FrameError::Truncated { len: filled }.into());
                }
                Ok(n) => {
                    let had_header = filled >= HEADER_SIZE;
                    filled += n;
                    if !had_header && filled >= HEADER_SIZE {
                        needed = HEADER_SIZE + self.payload_len(&buf[..HEADER_SIZE])?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        // Keep what we have so the frame boundary survives for the next call
                        self.partial.extend_from_slice(&buf[..filled]);
                        return Err(TransportError::Timeout);
                    }
                    self.sleep_until(deadline);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("TCP connection closed");
        }
        self.partial.clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for BlockingTcpChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
