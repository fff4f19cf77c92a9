//! DoIP protocol engine
//!
//! [DoipClient] drives the connection state machine and implements the
//! routing activation and diagnostic message exchanges on top of any
//! [DoipChannel]. Vehicle discovery lives in [discovery](self::discovery),
//! alive check and acknowledgement handling in [alive_check](self::alive_check).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

use crate::{
    channel::{ChannelResult, DoipChannel, TransportError},
    frame::{DoipMessage, PayloadType},
    uds, ConnectError, DiagError, DiagServerResult,
};

pub mod alive_check;
pub mod discovery;

pub use alive_check::IncomingEvent;

/// Standard DoIP UDP discovery and TCP data port
pub const DOIP_PORT: u16 = 13400;
/// Default logical address of the tester
pub const DEFAULT_TESTER_ADDRESS: u16 = 0x0E80;
/// Routing activation response code for "routing successfully activated"
pub const ROUTING_ACTIVATION_SUCCESS: u8 = 0x10;
/// Offset of the response code in the routing activation response payload
const ROUTING_RESPONSE_CODE_OFFSET: usize = 4;
/// Source and target address in front of every diagnostic message
const DIAG_ADDRESS_PREFIX: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// DoIP client configuration
pub struct DoipClientSettings {
    /// Logical address of this tester
    pub source_address: u16,
    /// Routing activation type (0x00 = default)
    pub activation_type: u8,
    /// Destination of the vehicle identification request
    pub discovery_address: SocketAddr,
    /// TCP port of the DoIP entity when it is not taken from the announcement
    pub tcp_port: u16,
    /// Time to wait for a vehicle announcement
    pub discovery_timeout_ms: u32,
    /// Time to wait for the TCP connection and the routing activation response
    pub tcp_timeout_ms: u32,
    /// Time to wait for a diagnostic response
    pub diag_timeout_ms: u32,
}

impl Default for DoipClientSettings {
    fn default() -> Self {
        Self {
            source_address: DEFAULT_TESTER_ADDRESS,
            activation_type: 0x00,
            discovery_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DOIP_PORT),
            tcp_port: DOIP_PORT,
            discovery_timeout_ms: 5000,
            tcp_timeout_ms: 10000,
            diag_timeout_ms: 10000,
        }
    }
}

/// Connection state of a [DoipClient]
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::FromRepr,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ClientState {
    /// No activity
    Idle = 0,
    /// Waiting for a vehicle announcement
    Discovering = 1,
    /// A vehicle was found
    Discovered = 2,
    /// Opening the TCP connection
    Connecting = 3,
    /// TCP connection open, routing not yet active
    Connected = 4,
    /// Routing active, diagnostic requests are accepted
    Activated = 5,
    /// The last operation failed
    Error = 6,
}

/// Identity of a discovered DoIP entity
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VehicleInfo {
    /// Vehicle identification number (up to 17 ASCII characters)
    pub vin: String,
    /// Logical address of the DoIP entity
    pub logical_address: u16,
    /// Entity ID (EID)
    pub entity_id: [u8; 6],
    /// Group ID (GID)
    pub group_id: [u8; 2],
    /// Address the entity answered from
    pub ip_address: IpAddr,
    /// TCP data port of the entity
    pub tcp_port: u16,
}

/// Read only view of a client's state, which can be shared with other threads
#[derive(Debug, Clone)]
pub struct StatusHandle {
    state: Arc<AtomicU8>,
    vehicle: Arc<RwLock<Option<VehicleInfo>>>,
}

impl StatusHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ClientState::Idle as u8)),
            vehicle: Arc::new(RwLock::new(None)),
        }
    }

    /// Current state of the client
    pub fn state(&self) -> ClientState {
        ClientState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(ClientState::Error)
    }

    /// Last vehicle the client discovered or connected to
    pub fn vehicle_info(&self) -> Option<VehicleInfo> {
        match self.vehicle.read() {
            Ok(v) => v.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_vehicle(&self, info: Option<VehicleInfo>) {
        match self.vehicle.write() {
            Ok(mut v) => *v = info,
            Err(p) => *p.into_inner() = info,
        }
    }
}

/// DoIP client
///
/// Owns the connection state and one transport channel. All calls block the
/// calling thread for at most the timeout they are given.
#[derive(Debug)]
pub struct DoipClient<C: DoipChannel> {
    channel: C,
    settings: DoipClientSettings,
    state: ClientState,
    vehicle: Option<VehicleInfo>,
    status: StatusHandle,
}

impl<C: DoipChannel> DoipClient<C> {
    /// Creates a new client in the [ClientState::Idle] state
    pub fn new(channel: C, settings: DoipClientSettings) -> Self {
        log::debug!(
            "DoIP client created, tester address 0x{:04X}",
            settings.source_address
        );
        Self {
            channel,
            settings,
            state: ClientState::Idle,
            vehicle: None,
            status: StatusHandle::new(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Last vehicle discovered or connected to. Kept across disconnects
    pub fn vehicle_info(&self) -> Option<&VehicleInfo> {
        self.vehicle.as_ref()
    }

    /// Client configuration
    pub fn settings(&self) -> &DoipClientSettings {
        &self.settings
    }

    /// Returns a handle which observes this client's state from other threads
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Underlying transport channel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub(crate) fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            log::debug!("DoIP client state {} -> {}", self.state, state);
        }
        self.state = state;
        self.status.set_state(state);
    }

    pub(crate) fn set_vehicle(&mut self, info: VehicleInfo) {
        self.status.set_vehicle(Some(info.clone()));
        self.vehicle = Some(info);
    }

    /// Logical address of the current vehicle, 0 if none is known
    pub(crate) fn target_address(&self) -> u16 {
        self.vehicle.as_ref().map(|v| v.logical_address).unwrap_or(0)
    }

    pub(crate) fn send_payload<P: Into<u16>>(
        &mut self,
        payload_type: P,
        payload: &[u8],
    ) -> ChannelResult<()> {
        let msg = DoipMessage::new(payload_type, payload)?;
        self.channel.send_message(&msg)
    }

    /// Opens a TCP connection to `vehicle` and activates routing.
    ///
    /// On success the client is [ClientState::Activated]. On any failure the
    /// connection is closed again and the client is [ClientState::Error].
    ///
    /// ## Parameters
    /// * vehicle - DoIP entity to connect to (usually from [DoipClient::discover])
    /// * timeout_ms - Time allowed for the TCP connection, and again for the activation response
    pub fn connect_and_activate(
        &mut self,
        vehicle: &VehicleInfo,
        timeout_ms: u32,
    ) -> Result<(), ConnectError> {
        if self.channel.is_connected() {
            self.channel.disconnect();
        }
        self.set_vehicle(vehicle.clone());
        self.set_state(ClientState::Connecting);
        log::info!(
            "Connecting to DoIP entity {}:{} (logical address 0x{:04X})",
            vehicle.ip_address,
            vehicle.tcp_port,
            vehicle.logical_address
        );
        let res = self.try_connect_and_activate(vehicle, timeout_ms);
        if let Err(e) = &res {
            log::error!("Routing activation failed: {e}");
            self.channel.disconnect();
            self.set_state(ClientState::Error);
        }
        res
    }

    fn try_connect_and_activate(
        &mut self,
        vehicle: &VehicleInfo,
        timeout_ms: u32,
    ) -> Result<(), ConnectError> {
        self.channel
            .connect(vehicle.ip_address, vehicle.tcp_port, timeout_ms)?;
        self.set_state(ClientState::Connected);

        let sa = self.settings.source_address.to_be_bytes();
        let request = [sa[0], sa[1], self.settings.activation_type, 0, 0, 0, 0];
        self.send_payload(PayloadType::RoutingActivationRequest, &request)?;

        let response = self.channel.receive_message(timeout_ms)?;
        if response.kind() != PayloadType::RoutingActivationResponse {
            return Err(ConnectError::UnexpectedPayloadType(response.payload_type));
        }
        let data = response.data();
        let code = *data
            .get(ROUTING_RESPONSE_CODE_OFFSET)
            .ok_or(ConnectError::InvalidResponseLength(data.len()))?;
        if code != ROUTING_ACTIVATION_SUCCESS {
            return Err(ConnectError::ActivationDenied { code });
        }
        self.set_state(ClientState::Activated);
        log::info!("Routing activated");
        Ok(())
    }

    /// Closes the connection and returns to [ClientState::Idle].
    /// The last vehicle information is kept
    pub fn disconnect(&mut self) {
        if self.channel.is_connected() {
            log::info!("Disconnecting from DoIP entity");
        }
        self.channel.disconnect();
        self.set_state(ClientState::Idle);
    }

    /// Receives the next message from the DoIP entity, without interpreting it.
    /// Use [DoipClient::dispatch] to handle it
    pub fn receive_message(&mut self, timeout_ms: u32) -> ChannelResult<DoipMessage> {
        self.channel.receive_message(timeout_ms)
    }

    /// Sends a UDS request with a 16 bit data identifier and returns the UDS response.
    ///
    /// The returned bytes start at the UDS response service ID, the DoIP source and
    /// target addresses are removed. Positive acknowledgements and alive check requests
    /// arriving before the response are handled in place. A `ResponsePending` negative
    /// response restarts the wait.
    ///
    /// Only allowed in [ClientState::Activated], otherwise nothing is sent and
    /// [DiagError::NotActivated] is returned.
    pub fn diagnostic_request(
        &mut self,
        service_id: u8,
        data_id: u16,
        timeout_ms: u32,
    ) -> DiagServerResult<Vec<u8>> {
        let did = data_id.to_be_bytes();
        self.send_uds(&[service_id, did[0], did[1]], timeout_ms)
    }

    /// Same as [DoipClient::diagnostic_request], but copies the response into `buf`.
    ///
    /// ## Returns
    /// Number of bytes written. The response is truncated to `buf.len()` if it does not fit
    pub fn diagnostic_request_into(
        &mut self,
        service_id: u8,
        data_id: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> DiagServerResult<usize> {
        let resp = self.diagnostic_request(service_id, data_id, timeout_ms)?;
        let len = std::cmp::min(resp.len(), buf.len());
        if len < resp.len() {
            log::warn!(
                "Diagnostic response truncated from {} to {} bytes",
                resp.len(),
                len
            );
        }
        buf[..len].copy_from_slice(&resp[..len]);
        Ok(len)
    }

    /// Sends a raw UDS payload in a diagnostic message and waits for the UDS response
    pub fn send_uds(&mut self, uds_payload: &[u8], timeout_ms: u32) -> DiagServerResult<Vec<u8>> {
        if self.state != ClientState::Activated {
            return Err(DiagError::NotActivated(self.state));
        }
        let res = self.exchange_uds(uds_payload, timeout_ms);
        if let Err(DiagError::Transport(e)) = &res {
            log::error!("Diagnostic transport failure: {e}");
            self.set_state(ClientState::Error);
        }
        res
    }

    fn exchange_uds(&mut self, uds_payload: &[u8], timeout_ms: u32) -> DiagServerResult<Vec<u8>> {
        let sa = self.settings.source_address.to_be_bytes();
        let ta = self.target_address().to_be_bytes();
        let mut payload = Vec::with_capacity(DIAG_ADDRESS_PREFIX + uds_payload.len());
        payload.extend_from_slice(&sa);
        payload.extend_from_slice(&ta);
        payload.extend_from_slice(uds_payload);
        self.send_payload(PayloadType::DiagnosticMessage, &payload)?;

        let sid = uds_payload.first().copied().unwrap_or(0);
        let timeout = Duration::from_millis(timeout_ms as u64);
        let mut deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout.into());
            }
            let msg = self.channel.receive_message(remaining.as_millis() as u32)?;
            match msg.kind() {
                PayloadType::DiagnosticMessagePositiveAck => {
                    self.handle_diagnostic_ack(&msg);
                }
                PayloadType::DiagnosticMessageNegativeAck => {
                    let code = msg.data().get(DIAG_ADDRESS_PREFIX).copied().unwrap_or(0xFF);
                    log::warn!("Diagnostic message rejected by gateway, code 0x{code:02X}");
                    return Err(DiagError::NegativeAck { code });
                }
                PayloadType::AliveCheckRequest => {
                    self.handle_alive_check_request(&msg)?;
                }
                PayloadType::AliveCheckResponse => {
                    self.handle_alive_check_response(&msg);
                }
                PayloadType::DiagnosticMessage => {
                    let data = msg.data();
                    if data.len() <= DIAG_ADDRESS_PREFIX {
                        return Err(DiagError::EmptyResponse);
                    }
                    if data[0..2] != ta || data[2..4] != sa {
                        log::warn!(
                            "Ignoring diagnostic message from 0x{:02X}{:02X} to 0x{:02X}{:02X}",
                            data[0],
                            data[1],
                            data[2],
                            data[3]
                        );
                        continue;
                    }
                    let resp = &data[DIAG_ADDRESS_PREFIX..];
                    log::debug!("UDS response: {resp:02X?}");
                    if resp[0] == uds::NEGATIVE_RESPONSE_SID && resp.len() >= 3 && resp[1] == sid {
                        if resp[2] == uds::RESPONSE_PENDING {
                            log::debug!("ECU response pending, waiting again");
                            deadline = Instant::now() + timeout;
                            continue;
                        }
                        return Err(uds::ecu_error(resp[2]));
                    }
                    return Ok(resp.to_vec());
                }
                _ => return Err(DiagError::UnexpectedPayloadType(msg.payload_type)),
            }
        }
    }
}
