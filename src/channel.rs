//! Module for message level communication channels with a DoIP entity
//!
//! Both transport backends implement [DoipChannel]:
//! * [crate::transport::blocking::BlockingTcpChannel] - Polled, blocking socket backend
//! * [crate::transport::event::EventChannel] - Callback driven backend fed by a [crate::transport::event::NetworkStack]

use std::net::IpAddr;

use crate::frame::{DoipMessage, FrameError};

/// Communication channel result
pub type ChannelResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by a communication channel
pub enum TransportError {
    /// No complete message arrived within the timeout
    #[error("Timeout waiting for data")]
    Timeout,
    /// The peer ended the connection
    #[error("Connection closed by peer")]
    Closed,
    /// Incoming data could not be framed
    #[error("Malformed frame: {0}")]
    Malformed(
        #[from]
        #[source]
        FrameError,
    ),
    /// Connecting to the peer failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    /// Writing to the peer failed
    #[error("Send failed: {0}")]
    SendFailed(String),
    /// The channel is not connected
    #[error("Channel is not connected")]
    NotConnected,
    /// Underlying IO Error with channel
    #[error("IO error: {0}")]
    IOError(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/// Message level transport to a DoIP entity.
///
/// Every blocking call takes an explicit timeout, there is no implicit
/// global timeout. Implementations must never block forever.
pub trait DoipChannel: Send {
    /// Connects to the DoIP entity at `ip:port`.
    ///
    /// ## Parameters
    /// * ip - Address of the DoIP entity
    /// * port - TCP data port of the DoIP entity
    /// * timeout_ms - Time to wait for the connection to be established
    fn connect(&mut self, ip: IpAddr, port: u16, timeout_ms: u32) -> ChannelResult<()>;

    /// Sends raw bytes over the connection
    fn send(&mut self, data: &[u8]) -> ChannelResult<()>;

    /// Blocks until one complete DoIP message was received.
    ///
    /// ## Parameters
    /// * timeout_ms - Maximum time to wait for a complete message.
    ///
    /// ## Returns
    /// * [TransportError::Timeout] if no complete message arrived
    /// * [TransportError::Closed] if the peer ended the connection
    /// * [TransportError::Malformed] if the header was rejected
    fn receive_message(&mut self, timeout_ms: u32) -> ChannelResult<DoipMessage>;

    /// Closes the connection. Calling this on a closed channel does nothing
    fn disconnect(&mut self);

    /// Returns true if the channel currently holds a connection
    fn is_connected(&self) -> bool;

    /// Encodes and sends a DoIP message
    fn send_message(&mut self, msg: &DoipMessage) -> ChannelResult<()> {
        log::debug!("DoIP Tx {}: {:02X?}", msg.kind(), msg.data());
        self.send(&msg.encode())
    }
}

impl<T: DoipChannel + ?Sized> DoipChannel for Box<T> {
    fn connect(&mut self, ip: IpAddr, port: u16, timeout_ms: u32) -> ChannelResult<()> {
        (**self).connect(ip, port, timeout_ms)
    }

    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        (**self).send(data)
    }

    fn receive_message(&mut self, timeout_ms: u32) -> ChannelResult<DoipMessage> {
        (**self).receive_message(timeout_ms)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send_message(&mut self, msg: &DoipMessage) -> ChannelResult<()> {
        (**self).send_message(msg)
    }
}
