#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate implementing a Diagnostics over IP (DoIP, ISO13400-2) client, used to
//! discover an in-vehicle ECU gateway, activate routing to it, and exchange UDS
//! requests tunneled inside DoIP frames.
//!
//! ## Protocol engine
//!
//! [client::DoipClient] owns the connection state machine:
//!
//! `Idle -> Discovering -> Discovered -> Connecting -> Connected -> Activated`
//!
//! Any failure moves the client into `Error`, and [client::DoipClient::disconnect]
//! always returns it to `Idle`. Diagnostic requests are only accepted once routing
//! was activated.
//!
//! ## Transports
//!
//! The engine talks to the gateway through a [channel::DoipChannel]. Two backends are provided:
//!
//! ### Blocking backend
//! [transport::blocking::BlockingTcpChannel] - A polled TCP socket on the calling thread.
//!
//! ### Event backend
//! [transport::event::EventChannel] - A channel fed by network stack callbacks. Inbound
//! bytes go through a bounded lock free queue, connect and send completion are signalled
//! from the stack's context. Use this for stacks which only offer a callback API.
//!
//! ## Cyclic driver
//!
//! [driver::CyclicDriver] runs discovery, routing activation, a fixed UDS read sequence,
//! an alive check and a short listen window in a loop on a background thread, tolerating
//! failure at every step.
//!
//! ## UDS
//!
//! Only `ReadDataByIdentifier` (0x22) is implemented, see [uds].

use channel::TransportError;
use client::ClientState;
use frame::FrameError;

pub mod channel;
pub mod client;
pub mod driver;
pub mod frame;
pub mod transport;
pub mod uds;

pub use client::{DoipClient, DoipClientSettings, StatusHandle, VehicleInfo};

/// Result of a UDS request over DoIP
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by vehicle discovery
pub enum DiscoveryError {
    /// The UDP socket could not be used
    #[error("Discovery socket error")]
    IOError(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// No vehicle announcement arrived in time
    #[error("No vehicle announcement received")]
    NoResponse,
    /// The announcement could not be framed
    #[error("Malformed vehicle announcement")]
    Malformed(
        #[from]
        #[source]
        FrameError,
    ),
    /// Something other than a vehicle announcement was received
    #[error("Unexpected discovery response type 0x{0:04X}")]
    UnexpectedPayloadType(u16),
    /// The vehicle announcement payload was too short
    #[error("Vehicle announcement payload too short ({0} bytes)")]
    PayloadTooShort(usize),
}

#[derive(Debug, thiserror::Error)]
/// Error produced while connecting to and activating routing on a DoIP entity
pub enum ConnectError {
    /// Underlying transport error
    #[error("Transport error during routing activation")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// Gateway replied with something other than a routing activation response
    #[error("Unexpected routing activation response type 0x{0:04X}")]
    UnexpectedPayloadType(u16),
    /// Routing activation response was too short to hold a response code
    #[error("Routing activation response too short ({0} bytes)")]
    InvalidResponseLength(usize),
    /// Gateway denied routing activation
    #[error("Routing activation denied, response code 0x{code:02X}")]
    ActivationDenied {
        /// Routing activation response code
        code: u8,
    },
}

#[derive(Debug, thiserror::Error)]
/// Error produced by a diagnostic request
pub enum DiagError {
    /// Diagnostic requests are only accepted once routing is activated
    #[error("Client is not activated (state {0})")]
    NotActivated(ClientState),
    /// Underlying transport error
    #[error("Transport error during diagnostic request")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// Gateway replied with a payload type that is not part of a diagnostic exchange
    #[error("Unexpected diagnostic response type 0x{0:04X}")]
    UnexpectedPayloadType(u16),
    /// Gateway rejected the diagnostic message
    #[error("Diagnostic message negative acknowledgement, code 0x{code:02X}")]
    NegativeAck {
        /// DoIP diagnostic NACK code
        code: u8,
    },
    /// Diagnostic error code from the ECU itself
    #[error("ECU Negative response. Error 0x{:02X?}, definition: {:?}", code, def)]
    ECUError {
        /// Raw Negative response code from ECU
        code: u8,
        /// Negative response code definition according to protocol
        def: Option<String>,
    },
    /// Response empty
    #[error("ECU did not respond to the request")]
    EmptyResponse,
    /// ECU Responded but send a message that wasn't a reply for the sent message
    #[error("ECU response is out of order")]
    WrongMessage,
    /// ECU Responded with a message, but the length was incorrect
    #[error("ECU response size was not the correct length")]
    InvalidResponseLength,
    /// Mismatched data identifier in the response
    #[error(
        "Requested Ident 0x{:04X?}, but received ident 0x{:04X?}",
        want,
        received
    )]
    MismatchedIdentResponse {
        /// Requested identifier
        want: u16,
        /// Received identifier from ECU
        received: u16,
    },
}
