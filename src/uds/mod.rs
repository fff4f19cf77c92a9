//! Module for UDS (Unified diagnostic services - ISO14229) over DoIP
//!
//! Only the services needed to identify a vehicle are implemented, see
//! [read_data_by_identifier](self::read_data_by_identifier)

use automotive_diag::uds::UdsErrorByte;

use crate::{DiagError, DiagServerResult};

mod read_data_by_identifier;

pub use automotive_diag::uds::UdsCommand;
pub use read_data_by_identifier::*;

/// Added to the request service ID in a positive response
pub const POSITIVE_RESPONSE_MASK: u8 = 0x40;
/// Service ID of a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// Negative response code telling the tester to keep waiting
pub const RESPONSE_PENDING: u8 = 0x78;

/// Well known data identifiers read by this client
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::FromRepr,
    strum_macros::EnumIter,
)]
#[repr(u16)]
pub enum DataIdentifier {
    /// Vehicle identification number
    Vin = 0xF190,
    /// ECU software version
    SoftwareVersion = 0xF1A0,
    /// ECU hardware version
    HardwareVersion = 0xF1A1,
}

impl From<DataIdentifier> for u16 {
    fn from(did: DataIdentifier) -> Self {
        did as u16
    }
}

/// Looks up the name of a UDS negative response code
pub fn lookup_uds_nrc(code: u8) -> String {
    format!("{:?}", UdsErrorByte::from(code))
}

pub(crate) fn ecu_error(code: u8) -> DiagError {
    DiagError::ECUError {
        code,
        def: Some(lookup_uds_nrc(code)),
    }
}

/// Checks if the response payload matches the request ServiceID.
///
/// ## Parameters
/// * sid - The SID to match against
/// * resp - Response from the ECU to check
pub(crate) fn check_pos_response_id(sid: u8, resp: Vec<u8>) -> DiagServerResult<Vec<u8>> {
    match resp.first() {
        None => Err(DiagError::EmptyResponse),
        Some(&NEGATIVE_RESPONSE_SID) if resp.len() >= 3 => Err(ecu_error(resp[2])),
        Some(&r) if r != sid | POSITIVE_RESPONSE_MASK => {
            log::error!("ECU SID mismatch. Request SID was 0x{sid:02X}, response SID was 0x{r:02X}");
            Err(DiagError::WrongMessage)
        }
        Some(_) => Ok(resp),
    }
}
