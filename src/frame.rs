//! DoIP frame codec (ISO 13400-2 generic header)
//!
//! Every DoIP message starts with an 8 byte header:
//!
//! | Byte | Content                                   |
//! |------|-------------------------------------------|
//! | 0    | Protocol version ([PROTOCOL_VERSION])     |
//! | 1    | Inverse protocol version                  |
//! | 2-3  | Payload type (big endian)                 |
//! | 4-7  | Payload length (big endian)               |
//!
//! followed by `payload_length` bytes of payload.

/// Protocol version used by this client (ISO 13400-2:2012)
pub const PROTOCOL_VERSION: u8 = 0x02;
/// Bitwise inverse of [PROTOCOL_VERSION]
pub const INVERSE_PROTOCOL_VERSION: u8 = !PROTOCOL_VERSION;
/// Size of the generic DoIP header
pub const HEADER_SIZE: usize = 8;
/// Largest payload this client will accept or produce
pub const MAX_PAYLOAD: usize = 1024;
/// Largest complete frame (header + payload)
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

/// Frame codec result
pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
/// Error produced when a DoIP frame is rejected
pub enum FrameError {
    /// Fewer than [HEADER_SIZE] bytes were given
    #[error("Frame truncated, only {len} bytes available")]
    Truncated {
        /// Number of bytes that were available
        len: usize,
    },
    /// Version byte pair did not match [PROTOCOL_VERSION] / [INVERSE_PROTOCOL_VERSION]
    #[error("Protocol version mismatch (0x{version:02X}/0x{inverse:02X})")]
    VersionMismatch {
        /// Received protocol version
        version: u8,
        /// Received inverse protocol version
        inverse: u8,
    },
    /// Declared payload length exceeds [MAX_PAYLOAD]
    #[error("Declared payload length {declared} exceeds maximum of {MAX_PAYLOAD}")]
    PayloadTooLarge {
        /// Declared payload length
        declared: usize,
    },
}

/// DoIP payload types handled by the client
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PayloadType {
    /// Vehicle identification request (UDP broadcast)
    VehicleIdentificationRequest,
    /// Vehicle identification response / vehicle announcement
    VehicleIdentificationResponse,
    /// Routing activation request
    RoutingActivationRequest,
    /// Routing activation response
    RoutingActivationResponse,
    /// Alive check request
    AliveCheckRequest,
    /// Alive check response
    AliveCheckResponse,
    /// Diagnostic message (carries UDS)
    DiagnosticMessage,
    /// Diagnostic message positive acknowledgement
    DiagnosticMessagePositiveAck,
    /// Diagnostic message negative acknowledgement
    DiagnosticMessageNegativeAck,
    /// Any payload type this client does not handle
    Other(u16),
}

impl From<u16> for PayloadType {
    fn from(raw: u16) -> Self {
        match raw {
            0x0001 => PayloadType::VehicleIdentificationRequest,
            0x0004 => PayloadType::VehicleIdentificationResponse,
            0x0005 => PayloadType::RoutingActivationRequest,
            0x0006 => PayloadType::RoutingActivationResponse,
            0x0007 => PayloadType::AliveCheckRequest,
            0x0008 => PayloadType::AliveCheckResponse,
            0x8001 => PayloadType::DiagnosticMessage,
            0x8002 => PayloadType::DiagnosticMessagePositiveAck,
            0x8003 => PayloadType::DiagnosticMessageNegativeAck,
            _ => PayloadType::Other(raw),
        }
    }
}

impl From<PayloadType> for u16 {
    fn from(pt: PayloadType) -> Self {
        match pt {
            PayloadType::VehicleIdentificationRequest => 0x0001,
            PayloadType::VehicleIdentificationResponse => 0x0004,
            PayloadType::RoutingActivationRequest => 0x0005,
            PayloadType::RoutingActivationResponse => 0x0006,
            PayloadType::AliveCheckRequest => 0x0007,
            PayloadType::AliveCheckResponse => 0x0008,
            PayloadType::DiagnosticMessage => 0x8001,
            PayloadType::DiagnosticMessagePositiveAck => 0x8002,
            PayloadType::DiagnosticMessageNegativeAck => 0x8003,
            PayloadType::Other(x) => x,
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadType::Other(x) => write!(f, "Unknown(0x{x:04X})"),
            _ => write!(f, "{:?}(0x{:04X})", self, u16::from(*self)),
        }
    }
}

/// A single DoIP message.
///
/// Two messages are equal when their version bytes, payload type and
/// [DoipMessage::data] match. Bytes past `payload_length` are ignored
#[derive(Debug, Clone)]
pub struct DoipMessage {
    /// Protocol version byte
    pub protocol_version: u8,
    /// Inverse protocol version byte
    pub inverse_protocol_version: u8,
    /// Raw payload type
    pub payload_type: u16,
    /// Declared payload length
    pub payload_length: u32,
    /// Payload bytes. Only the first `payload_length` bytes are meaningful
    pub payload: Vec<u8>,
}

impl DoipMessage {
    /// Creates a message with this clients protocol version pair.
    ///
    /// Returns [FrameError::PayloadTooLarge] if `payload` is larger than [MAX_PAYLOAD]
    pub fn new<P: Into<u16>>(payload_type: P, payload: &[u8]) -> FrameResult<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                declared: payload.len(),
            });
        }
        Ok(Self {
            protocol_version: PROTOCOL_VERSION,
            inverse_protocol_version: INVERSE_PROTOCOL_VERSION,
            payload_type: payload_type.into(),
            payload_length: payload.len() as u32,
            payload: payload.to_vec(),
        })
    }

    /// Typed payload type
    pub fn kind(&self) -> PayloadType {
        PayloadType::from(self.payload_type)
    }

    /// Meaningful payload bytes (bounded by both the declared length and what is present)
    pub fn data(&self) -> &[u8] {
        let len = std::cmp::min(self.payload_length as usize, self.payload.len());
        &self.payload[..len]
    }

    /// Serializes the message into wire format
    pub fn encode(&self) -> Vec<u8> {
        let data = self.data();
        let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
        buf.push(self.protocol_version);
        buf.push(self.inverse_protocol_version);
        buf.extend_from_slice(&self.payload_type.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }
}

impl PartialEq for DoipMessage {
    fn eq(&self, other: &Self) -> bool {
        self.protocol_version == other.protocol_version
            && self.inverse_protocol_version == other.inverse_protocol_version
            && self.payload_type == other.payload_type
            && self.data() == other.data()
    }
}

impl Eq for DoipMessage {}

/// Result of [decode]. The declared payload length is kept even when
/// fewer bytes were physically present, which allows reading a header
/// first and pulling the payload afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Decoded message. `payload` holds only the bytes that were present
    pub message: DoipMessage,
    /// Number of payload bytes that were present in the input
    pub payload_present: usize,
}

impl DecodedMessage {
    /// True if every declared payload byte was present
    pub fn is_complete(&self) -> bool {
        self.payload_present == self.message.payload_length as usize
    }

    /// Number of payload bytes still missing
    pub fn missing(&self) -> usize {
        self.message.payload_length as usize - self.payload_present
    }
}

/// Validates the generic header of `bytes`, returning the payload type and declared length
pub fn decode_header(bytes: &[u8]) -> FrameResult<(u16, usize)> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::Truncated { len: bytes.len() });
    }
    if bytes[0] != PROTOCOL_VERSION || bytes[1] != INVERSE_PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch {
            version: bytes[0],
            inverse: bytes[1],
        });
    }
    let payload_type = u16::from_be_bytes([bytes[2], bytes[3]]);
    let declared = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if declared > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge { declared });
    }
    Ok((payload_type, declared))
}

/// Decodes a DoIP message from `bytes`
pub fn decode(bytes: &[u8]) -> FrameResult<DecodedMessage> {
    let (payload_type, declared) = decode_header(bytes)?;
    let available = &bytes[HEADER_SIZE..];
    let present = std::cmp::min(available.len(), declared);
    Ok(DecodedMessage {
        message: DoipMessage {
            protocol_version: bytes[0],
            inverse_protocol_version: bytes[1],
            payload_type,
            payload_length: declared as u32,
            payload: available[..present].to_vec(),
        },
        payload_present: present,
    })
}
