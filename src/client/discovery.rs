//! Vehicle discovery over UDP

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use crate::{
    channel::DoipChannel,
    frame::{self, DoipMessage, PayloadType, MAX_FRAME_SIZE},
    DiscoveryError,
};

use super::{ClientState, DoipClient, VehicleInfo};

/// VIN(17) + logical address(2) + EID(6) + GID(2) + further action(1)
pub const MIN_ANNOUNCEMENT_LEN: usize = 28;
const VIN_LEN: usize = 17;

impl VehicleInfo {
    /// Parses a vehicle identification response payload.
    ///
    /// ## Parameters
    /// * payload - Vehicle announcement payload
    /// * ip_address - Address the announcement came from
    /// * tcp_port - TCP data port to use for this entity
    pub fn from_announcement(
        payload: &[u8],
        ip_address: IpAddr,
        tcp_port: u16,
    ) -> Result<Self, DiscoveryError> {
        if payload.len() < MIN_ANNOUNCEMENT_LEN {
            return Err(DiscoveryError::PayloadTooShort(payload.len()));
        }
        let vin_bytes = &payload[..VIN_LEN];
        let vin_end = vin_bytes.iter().position(|b| *b == 0).unwrap_or(VIN_LEN);
        let mut entity_id = [0u8; 6];
        entity_id.copy_from_slice(&payload[19..25]);
        Ok(Self {
            vin: String::from_utf8_lossy(&vin_bytes[..vin_end]).into_owned(),
            logical_address: u16::from_be_bytes([payload[17], payload[18]]),
            entity_id,
            group_id: [payload[25], payload[26]],
            ip_address,
            tcp_port,
        })
    }
}

impl<C: DoipChannel> DoipClient<C> {
    /// Broadcasts a vehicle identification request and waits for the first answer.
    ///
    /// Any open TCP connection is closed first. There is no internal retry; on
    /// failure the client is [ClientState::Error].
    ///
    /// ## Parameters
    /// * timeout_ms - Time to wait for the vehicle announcement
    pub fn discover(&mut self, timeout_ms: u32) -> Result<VehicleInfo, DiscoveryError> {
        if self.channel.is_connected() {
            self.channel.disconnect();
        }
        self.set_state(ClientState::Discovering);
        log::info!(
            "Starting vehicle discovery on {}",
            self.settings.discovery_address
        );
        match self.try_discover(timeout_ms) {
            Ok(info) => {
                log::info!(
                    "Vehicle discovered. VIN: {}, logical address: 0x{:04X}, IP: {}",
                    info.vin,
                    info.logical_address,
                    info.ip_address
                );
                self.set_vehicle(info.clone());
                self.set_state(ClientState::Discovered);
                Ok(info)
            }
            Err(e) => {
                log::warn!("Vehicle discovery failed: {e}");
                self.set_state(ClientState::Error);
                Err(e)
            }
        }
    }

    fn try_discover(&self, timeout_ms: u32) -> Result<VehicleInfo, DiscoveryError> {
        let target = self.settings.discovery_address;
        let bind_ip = match target {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
        if target.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket.set_read_timeout(Some(Duration::from_millis(
            std::cmp::max(1, timeout_ms) as u64,
        )))?;

        let request = DoipMessage::new(PayloadType::VehicleIdentificationRequest, &[])?;
        socket.send_to(&request.encode(), target)?;
        log::debug!("Vehicle identification request sent");

        let mut buf = [0u8; MAX_FRAME_SIZE];
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(DiscoveryError::NoResponse);
            }
            Err(e) => return Err(e.into()),
        };
        let decoded = frame::decode(&buf[..len])?;
        let msg = decoded.message;
        if msg.kind() != PayloadType::VehicleIdentificationResponse {
            return Err(DiscoveryError::UnexpectedPayloadType(msg.payload_type));
        }
        VehicleInfo::from_announcement(msg.data(), from.ip(), self.settings.tcp_port)
    }
}
