//! Alive check and diagnostic acknowledgement handling, plus dispatch of
//! messages the DoIP entity sends without being asked

use crate::{
    channel::{ChannelResult, DoipChannel},
    frame::{DoipMessage, PayloadType},
};

use super::DoipClient;

/// Offset of the acknowledgement code in a diagnostic ACK / NACK payload
const ACK_CODE_OFFSET: usize = 4;

/// Outcome of [DoipClient::dispatch]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IncomingEvent {
    /// The entity checked if we are still alive
    AliveCheckRequest {
        /// True if a response was sent
        answered: bool,
    },
    /// The entity answered our alive check
    AliveCheckResponse {
        /// Source address in the response, if present
        source_address: Option<u16>,
    },
    /// Diagnostic message acknowledgement
    DiagnosticAck {
        /// True for a positive acknowledgement
        positive: bool,
    },
    /// Message with a payload type the client does not handle outside of a request
    Unhandled(PayloadType),
}

impl<C: DoipChannel> DoipClient<C> {
    /// Sends an alive check request carrying this tester's source address
    pub fn send_alive_check_request(&mut self) -> ChannelResult<()> {
        let sa = self.settings.source_address.to_be_bytes();
        self.send_payload(PayloadType::AliveCheckRequest, &sa)?;
        log::debug!("Alive check request sent");
        Ok(())
    }

    /// Answers an alive check request by echoing its 2 byte source address.
    ///
    /// ## Returns
    /// `Ok(false)` without sending anything if the request payload is shorter than 2 bytes
    pub fn handle_alive_check_request(&mut self, msg: &DoipMessage) -> ChannelResult<bool> {
        let data = msg.data();
        if data.len() < 2 {
            log::warn!(
                "Invalid alive check request payload length {}",
                data.len()
            );
            return Ok(false);
        }
        self.send_payload(PayloadType::AliveCheckResponse, &data[..2])?;
        log::debug!("Alive check response sent");
        Ok(true)
    }

    /// Logs an alive check response and returns the source address it carried
    pub fn handle_alive_check_response(&self, msg: &DoipMessage) -> Option<u16> {
        match msg.data() {
            [hi, lo, ..] => {
                let sa = u16::from_be_bytes([*hi, *lo]);
                log::info!("Alive check response received from 0x{sa:04X}");
                Some(sa)
            }
            short => {
                log::info!(
                    "Alive check response with short payload ({} bytes)",
                    short.len()
                );
                None
            }
        }
    }

    /// Sends a diagnostic message acknowledgement to the current vehicle.
    ///
    /// ## Parameters
    /// * ack_type - 0x00 sends a positive ACK, anything else a negative ACK with that code
    pub fn send_diagnostic_ack(&mut self, ack_type: u8) -> ChannelResult<()> {
        let payload_type = if ack_type == 0x00 {
            PayloadType::DiagnosticMessagePositiveAck
        } else {
            PayloadType::DiagnosticMessageNegativeAck
        };
        let sa = self.settings.source_address.to_be_bytes();
        let ta = self.target_address().to_be_bytes();
        self.send_payload(payload_type, &[sa[0], sa[1], ta[0], ta[1], ack_type])?;
        log::debug!("Diagnostic ACK sent (type 0x{ack_type:02X})");
        Ok(())
    }

    /// Returns true if `msg` is a positive diagnostic acknowledgement
    pub fn handle_diagnostic_ack(&self, msg: &DoipMessage) -> bool {
        let data = msg.data();
        if data.len() <= ACK_CODE_OFFSET {
            log::warn!("Invalid diagnostic ACK payload length {}", data.len());
            return false;
        }
        let sa = u16::from_be_bytes([data[0], data[1]]);
        let ta = u16::from_be_bytes([data[2], data[3]]);
        let code = data[ACK_CODE_OFFSET];
        log::debug!("Diagnostic ACK received: SA=0x{sa:04X}, TA=0x{ta:04X}, Type=0x{code:02X}");
        code == 0x00
    }

    /// Runs the matching handler for a message received outside of a request
    pub fn dispatch(&mut self, msg: &DoipMessage) -> ChannelResult<IncomingEvent> {
        let event = match msg.kind() {
            PayloadType::AliveCheckRequest => IncomingEvent::AliveCheckRequest {
                answered: self.handle_alive_check_request(msg)?,
            },
            PayloadType::AliveCheckResponse => IncomingEvent::AliveCheckResponse {
                source_address: self.handle_alive_check_response(msg),
            },
            PayloadType::DiagnosticMessagePositiveAck
            | PayloadType::DiagnosticMessageNegativeAck => IncomingEvent::DiagnosticAck {
                positive: self.handle_diagnostic_ack(msg),
            },
            other => {
                log::warn!("Unhandled message {other}");
                IncomingEvent::Unhandled(other)
            }
        };
        Ok(event)
    }
}
