//! Reads identification values from the ECU (service 0x22)

use automotive_diag::uds::UdsCommand;

use crate::{channel::DoipChannel, client::DoipClient, DiagError, DiagServerResult};

use super::{check_pos_response_id, DataIdentifier};

/// Longest valid VIN
pub const VIN_LEN: usize = 17;

fn trim_ascii(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

impl<C: DoipChannel> DoipClient<C> {
    /// Reads a data identifier from the ECU.
    ///
    /// ## Returns
    /// The value bytes, without the response SID and the echoed identifier
    pub fn read_data_by_identifier<D: Into<u16>>(&mut self, did: D) -> DiagServerResult<Vec<u8>> {
        let did: u16 = did.into();
        let sid: u8 = UdsCommand::ReadDataByIdentifier.into();
        let timeout = self.settings().diag_timeout_ms;
        let resp = self.diagnostic_request(sid, did, timeout)?;
        let resp = check_pos_response_id(sid, resp)?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        let received = u16::from_be_bytes([resp[1], resp[2]]);
        if received != did {
            return Err(DiagError::MismatchedIdentResponse { want: did, received });
        }
        Ok(resp[3..].to_vec())
    }

    fn read_string_identifier(&mut self, did: DataIdentifier) -> DiagServerResult<String> {
        let value = self.read_data_by_identifier(did)?;
        if value.is_empty() {
            return Err(DiagError::EmptyResponse);
        }
        let s = trim_ascii(&value);
        log::info!("{did}: {s}");
        Ok(s)
    }

    /// Reads the VIN (0xF190). At most [VIN_LEN] characters are returned
    pub fn read_vin(&mut self) -> DiagServerResult<String> {
        let value = self.read_data_by_identifier(DataIdentifier::Vin)?;
        if value.is_empty() {
            return Err(DiagError::EmptyResponse);
        }
        let vin = trim_ascii(&value[..std::cmp::min(VIN_LEN, value.len())]);
        log::info!("VIN: {vin}");
        Ok(vin)
    }

    /// Reads the ECU software version (0xF1A0)
    pub fn read_software_version(&mut self) -> DiagServerResult<String> {
        self.read_string_identifier(DataIdentifier::SoftwareVersion)
    }

    /// Reads the ECU hardware version (0xF1A1)
    pub fn read_hardware_version(&mut self) -> DiagServerResult<String> {
        self.read_string_identifier(DataIdentifier::HardwareVersion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{activated_client, diag_request, diag_response};

    #[test]
    fn test_read_vin() {
        let (mut client, sim) = activated_client();
        let mut resp = vec![0x62, 0xF1, 0x90];
        resp.extend_from_slice(b"W0L000051T2123456");
        sim.add_response(&diag_request(&[0x22, 0xF1, 0x90]), &[diag_response(&resp)]);
        assert_eq!(client.read_vin().unwrap(), "W0L000051T2123456");
    }

    #[test]
    fn test_read_versions_trimmed() {
        let (mut client, sim) = activated_client();
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0xA0]),
            &[diag_response(b"\x62\xF1\xA0SW 1.2.3  \0\0")],
        );
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0xA1]),
            &[diag_response(b"\x62\xF1\xA1HW-07")],
        );
        assert_eq!(client.read_software_version().unwrap(), "SW 1.2.3");
        assert_eq!(client.read_hardware_version().unwrap(), "HW-07");
    }

    #[test]
    fn test_read_mismatched_or_empty() {
        let (mut client, sim) = activated_client();
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0x90]),
            &[diag_response(&[0x62, 0xF1, 0x91, 0x41])],
        );
        assert!(matches!(
            client.read_vin(),
            Err(DiagError::MismatchedIdentResponse { want: 0xF190, received: 0xF191 })
        ));

        sim.clear();
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0xA0]),
            &[diag_response(&[0x62, 0xF1, 0xA0])],
        );
        assert!(matches!(client.read_software_version(), Err(DiagError::EmptyResponse)));

        sim.clear();
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0xA1]),
            &[diag_response(&[0x62, 0xF1])],
        );
        assert!(matches!(
            client.read_hardware_version(),
            Err(DiagError::InvalidResponseLength)
        ));
    }

    #[test]
    fn test_read_generic_identifier() {
        let (mut client, sim) = activated_client();
        sim.add_response(
            &diag_request(&[0x22, 0x01, 0x02]),
            &[diag_response(&[0x62, 0x01, 0x02, 0xAA, 0xBB])],
        );
        assert_eq!(client.read_data_by_identifier(0x0102u16).unwrap(), vec![0xAA, 0xBB]);
    }
}
