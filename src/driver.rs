//! Cyclic driver
//!
//! Runs the complete client sequence on a background thread:
//!
//! 1. Wait for the network link to be usable (see [LinkMonitor])
//! 2. Discover a vehicle
//! 3. Connect and activate routing
//! 4. Read VIN, software version and hardware version
//! 5. Send an alive check, then listen for messages from the entity for a short window
//! 6. Disconnect and sleep until the next cycle
//!
//! A failure at any step is logged and ends the cycle early. The driver never
//! gives up, the next cycle starts from discovery again.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bitflags::bitflags;

use crate::{
    channel::{DoipChannel, TransportError},
    client::{ClientState, DoipClient, IncomingEvent, StatusHandle, VehicleInfo},
    ConnectError, DiscoveryError,
};

/// Longest uninterrupted sleep, so that [DriverHandle::stop] is honoured quickly
const SLEEP_SLICE_MS: u32 = 50;

bitflags! {
    /// Readiness of the network interface used to reach the vehicle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct LinkStatus: u8 {
        /// Physical link detected
        const LINK_UP = 0b0000_0001;
        /// Interface is administratively up
        const INTERFACE_UP = 0b0000_0010;
        /// Interface has an IP address
        const HAS_ADDRESS = 0b0000_0100;
    }
}

/// Source of link and address readiness
pub trait LinkMonitor: Send {
    /// Current state of the link
    fn link_status(&self) -> LinkStatus;
}

impl<F: Fn() -> LinkStatus + Send> LinkMonitor for F {
    fn link_status(&self) -> LinkStatus {
        self()
    }
}

/// [LinkMonitor] for hosts where the OS manages the interface
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl LinkMonitor for AlwaysReady {
    fn link_status(&self) -> LinkStatus {
        LinkStatus::all()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Timing of the cyclic driver
pub struct CycleSettings {
    /// Delay before the first cycle
    pub startup_delay_ms: u32,
    /// Retry interval while the interface has no address
    pub address_retry_ms: u32,
    /// Retry interval while both link and interface are down
    pub link_retry_ms: u32,
    /// Settle time once the link is ready
    pub stabilization_ms: u32,
    /// Pause between the diagnostic reads
    pub diag_pause_ms: u32,
    /// Length of the listen window after the alive check
    pub listen_window_ms: u32,
    /// Receive timeout of one listen window iteration
    pub listen_poll_ms: u32,
    /// Sleep between two cycles
    pub cycle_interval_ms: u32,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            startup_delay_ms: 3000,
            address_retry_ms: 5000,
            link_retry_ms: 2000,
            stabilization_ms: 3000,
            diag_pause_ms: 1000,
            listen_window_ms: 3000,
            listen_poll_ms: 100,
            cycle_interval_ms: 10000,
        }
    }
}

/// What one session produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// VIN read over UDS
    pub vin: Option<String>,
    /// ECU software version
    pub software_version: Option<String>,
    /// ECU hardware version
    pub hardware_version: Option<String>,
    /// True if the alive check request was sent
    pub alive_check_sent: bool,
    /// Messages handled during the listen window
    pub events: Vec<IncomingEvent>,
    /// The session ended early because of a transport failure or a disconnect request
    pub interrupted: bool,
}

/// Result of [CyclicDriver::run_cycle]
#[derive(Debug)]
pub enum CycleOutcome {
    /// The driver was stopped before the cycle started
    Stopped,
    /// No vehicle was found
    DiscoveryFailed(DiscoveryError),
    /// The vehicle was found but routing could not be activated
    ConnectFailed {
        /// Vehicle that was found
        vehicle: VehicleInfo,
        /// Reason
        error: ConnectError,
    },
    /// A diagnostic session took place
    Completed {
        /// Vehicle the session was held with
        vehicle: VehicleInfo,
        /// Session results
        report: CycleReport,
    },
}

#[derive(Debug)]
struct DriverControl {
    running: AtomicBool,
    disconnect: AtomicBool,
    cycles: AtomicU32,
}

/// Runs the client sequence in a loop. See the [module](self) documentation
#[derive(Debug)]
pub struct CyclicDriver<C: DoipChannel, L: LinkMonitor = AlwaysReady> {
    client: DoipClient<C>,
    link: L,
    settings: CycleSettings,
    control: Arc<DriverControl>,
}

impl<C: DoipChannel, L: LinkMonitor> CyclicDriver<C, L> {
    /// Creates a driver around a client. Nothing runs until [CyclicDriver::run] or [CyclicDriver::spawn]
    pub fn new(client: DoipClient<C>, link: L, settings: CycleSettings) -> Self {
        Self {
            client,
            link,
            settings,
            control: Arc::new(DriverControl {
                running: AtomicBool::new(true),
                disconnect: AtomicBool::new(false),
                cycles: AtomicU32::new(0),
            }),
        }
    }

    /// The driven client
    pub fn client(&self) -> &DoipClient<C> {
        &self.client
    }

    /// Number of cycles run so far
    pub fn cycles(&self) -> u32 {
        self.control.cycles.load(Ordering::Relaxed)
    }

    fn running(&self) -> bool {
        self.control.running.load(Ordering::Relaxed)
    }

    /// Sleeps for `ms`, returning false early if the driver was stopped
    fn pause(&self, ms: u32) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms as u64);
        while self.running() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            std::thread::sleep(std::cmp::min(
                left,
                Duration::from_millis(SLEEP_SLICE_MS as u64),
            ));
        }
        false
    }

    /// True if the current session has to end now
    fn interrupted(&self) -> bool {
        !self.running() || self.control.disconnect.swap(false, Ordering::Relaxed)
    }

    /// Blocks until the link is usable. Returns false if the driver was stopped meanwhile
    pub fn wait_for_link(&self) -> bool {
        while self.running() {
            let status = self.link.link_status();
            if !status.contains(LinkStatus::HAS_ADDRESS) {
                log::warn!("Interface has no address yet, waiting");
                self.pause(self.settings.address_retry_ms);
                continue;
            }
            let link_up = status.contains(LinkStatus::LINK_UP);
            let if_up = status.contains(LinkStatus::INTERFACE_UP);
            if !link_up && !if_up {
                log::warn!("Link and interface are down, waiting");
                self.pause(self.settings.link_retry_ms);
                continue;
            } else if !link_up {
                log::info!("Interface up but link not detected, proceeding");
            }
            log::debug!("Link ready, waiting for it to settle");
            if !self.pause(self.settings.stabilization_ms) {
                return false;
            }
            if !self.link.link_status().contains(LinkStatus::INTERFACE_UP) {
                log::warn!("Interface went down while settling, retrying");
                continue;
            }
            return true;
        }
        false
    }

    /// Runs one discovery, session and disconnect. Never panics, failures are
    /// logged and returned in the outcome
    pub fn run_cycle(&mut self) -> CycleOutcome {
        if !self.running() {
            return CycleOutcome::Stopped;
        }
        let cycle = self.control.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("Starting DoIP cycle {cycle}");
        let discovery_timeout = self.client.settings().discovery_timeout_ms;
        let vehicle = match self.client.discover(discovery_timeout) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Cycle {cycle}: discovery failed: {e}");
                return CycleOutcome::DiscoveryFailed(e);
            }
        };
        let tcp_timeout = self.client.settings().tcp_timeout_ms;
        if let Err(error) = self.client.connect_and_activate(&vehicle, tcp_timeout) {
            log::warn!("Cycle {cycle}: connection failed: {error}");
            return CycleOutcome::ConnectFailed { vehicle, error };
        }

        // Only requests made while the session runs may end it
        if self.control.disconnect.swap(false, Ordering::Relaxed) {
            log::debug!("Dropping disconnect request made outside a session");
        }
        let report = self.run_session();
        self.client.disconnect();
        log::info!("Cycle {cycle} completed");
        CycleOutcome::Completed { vehicle, report }
    }

    fn session_alive(&self, report: &mut CycleReport) -> bool {
        if self.client.state() != ClientState::Activated || self.interrupted() {
            report.interrupted = true;
            return false;
        }
        true
    }

    fn run_session(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let pause = self.settings.diag_pause_ms;

        report.vin = self
            .client
            .read_vin()
            .map_err(|e| log::warn!("Reading VIN failed: {e}"))
            .ok();
        if !self.session_alive(&mut report) || !self.pause(pause) {
            return report;
        }
        report.software_version = self
            .client
            .read_software_version()
            .map_err(|e| log::warn!("Reading software version failed: {e}"))
            .ok();
        if !self.session_alive(&mut report) || !self.pause(pause) {
            return report;
        }
        report.hardware_version = self
            .client
            .read_hardware_version()
            .map_err(|e| log::warn!("Reading hardware version failed: {e}"))
            .ok();
        if !self.session_alive(&mut report) {
            return report;
        }

        match self.client.send_alive_check_request() {
            Ok(()) => report.alive_check_sent = true,
            Err(e) => {
                log::warn!("Alive check request failed: {e}");
                report.interrupted = true;
                return report;
            }
        }

        let window = Duration::from_millis(self.settings.listen_window_ms as u64);
        let start = Instant::now();
        while start.elapsed() < window {
            if self.interrupted() {
                report.interrupted = true;
                break;
            }
            let msg = match self.client.receive_message(self.settings.listen_poll_ms) {
                Ok(msg) => msg,
                Err(TransportError::Timeout) => continue,
                Err(e) => {
                    log::warn!("Listen window ended early: {e}");
                    report.interrupted = true;
                    break;
                }
            };
            match self.client.dispatch(&msg) {
                Ok(event) => report.events.push(event),
                Err(e) => {
                    log::warn!("Failed to handle {}: {e}", msg.kind());
                    report.interrupted = true;
                    break;
                }
            }
        }
        report
    }

    /// Runs cycles until stopped
    pub fn run(&mut self) {
        log::info!("DoIP cyclic driver started");
        if self.pause(self.settings.startup_delay_ms) {
            while self.wait_for_link() {
                match self.run_cycle() {
                    CycleOutcome::Completed { report, .. } => {
                        log::debug!("Cycle report: {report:?}")
                    }
                    CycleOutcome::Stopped => break,
                    _ => {}
                }
                if !self.pause(self.settings.cycle_interval_ms) {
                    break;
                }
            }
        }
        self.client.disconnect();
        log::info!("DoIP cyclic driver stopped");
    }
}

impl<C: DoipChannel + 'static, L: LinkMonitor + 'static> CyclicDriver<C, L> {
    /// Starts the driver on a background thread
    pub fn spawn(mut self) -> std::io::Result<DriverHandle> {
        let status = self.client.status_handle();
        let control = self.control.clone();
        let thread = std::thread::Builder::new()
            .name("doip-driver".into())
            .spawn(move || self.run())?;
        Ok(DriverHandle {
            status,
            control,
            thread: Some(thread),
        })
    }
}

/// Handle to a driver started with [CyclicDriver::spawn]. Dropping it stops the driver
#[derive(Debug)]
pub struct DriverHandle {
    status: StatusHandle,
    control: Arc<DriverControl>,
    thread: Option<JoinHandle<()>>,
}

impl DriverHandle {
    /// Current client state
    pub fn status(&self) -> ClientState {
        self.status.state()
    }

    /// Last vehicle the driver found
    pub fn vehicle_info(&self) -> Option<VehicleInfo> {
        self.status.vehicle_info()
    }

    /// Number of cycles started so far
    pub fn cycles(&self) -> u32 {
        self.control.cycles.load(Ordering::Relaxed)
    }

    /// Ends the current session at the next check point. The driver keeps running
    pub fn request_disconnect(&self) {
        self.control.disconnect.store(true, Ordering::Relaxed);
    }

    /// Stops the driver and waits for its thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.control.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::error!("DoIP driver thread panicked");
            }
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        client::{
            tests::{activation_request, activation_response, diag_request, diag_response},
            DoipClientSettings,
        },
        frame::{DoipMessage, PayloadType},
        transport::simulation::SimulationChannel,
    };

    fn fast_settings() -> CycleSettings {
        CycleSettings {
            startup_delay_ms: 0,
            address_retry_ms: 10,
            link_retry_ms: 10,
            stabilization_ms: 0,
            diag_pause_ms: 0,
            listen_window_ms: 50,
            listen_poll_ms: 10,
            cycle_interval_ms: 10,
        }
    }

    fn driver<L: LinkMonitor>(link: L) -> CyclicDriver<SimulationChannel, L> {
        let client = DoipClient::new(SimulationChannel::new(), Default::default());
        CyclicDriver::new(client, link, fast_settings())
    }

    #[test]
    fn test_default_cycle_settings() {
        let s = CycleSettings::default();
        assert_eq!(s.cycle_interval_ms, 10000);
        assert_eq!(s.listen_window_ms, 3000);
        assert_eq!(s.listen_poll_ms, 100);
        assert_eq!(s.diag_pause_ms, 1000);
    }

    #[test]
    fn test_link_readiness() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        // No address, then both down, then interface only
        let d = driver(move || match c.fetch_add(1, Ordering::SeqCst) {
            0 => LinkStatus::empty(),
            1 => LinkStatus::HAS_ADDRESS,
            _ => LinkStatus::HAS_ADDRESS | LinkStatus::INTERFACE_UP,
        });
        assert!(d.wait_for_link());
        // Third check passes, fourth is the re-check after settling
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    /// Answers a single vehicle identification request for logical address 0x1000
    fn announce_once() -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, from) = socket.recv_from(&mut buf).unwrap();
            let mut p = b"1HGCM82633A004352".to_vec();
            p.extend_from_slice(&[0x10, 0x00, 0, 1, 2, 3, 4, 5, 0, 0, 0]);
            let reply = DoipMessage::new(PayloadType::VehicleIdentificationResponse, &p).unwrap();
            socket.send_to(&reply.encode(), from).unwrap();
        });
        (addr, handle)
    }

    #[test]
    fn test_stale_disconnect_request_is_ignored() {
        let (addr, responder) = announce_once();
        let sim = SimulationChannel::new();
        sim.add_response(&activation_request(), &[activation_response(0x10)]);
        let mut vin = vec![0x62, 0xF1, 0x90];
        vin.extend_from_slice(b"1HGCM82633A004352");
        sim.add_response(&diag_request(&[0x22, 0xF1, 0x90]), &[diag_response(&vin)]);
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0xA0]),
            &[diag_response(&[0x62, 0xF1, 0xA0, b'S', b'W', b'1'])],
        );
        sim.add_response(
            &diag_request(&[0x22, 0xF1, 0xA1]),
            &[diag_response(&[0x62, 0xF1, 0xA1, b'H', b'W', b'2'])],
        );
        let settings = DoipClientSettings {
            discovery_address: addr,
            discovery_timeout_ms: 1000,
            ..Default::default()
        };
        let mut d = CyclicDriver::new(DoipClient::new(sim, settings), AlwaysReady, fast_settings());

        // Requested while no session was running
        d.control.disconnect.store(true, Ordering::Relaxed);
        match d.run_cycle() {
            CycleOutcome::Completed { report, .. } => {
                assert_eq!(report.vin.as_deref(), Some("1HGCM82633A004352"));
                assert_eq!(report.software_version.as_deref(), Some("SW1"));
                assert_eq!(report.hardware_version.as_deref(), Some("HW2"));
                assert!(report.alive_check_sent);
                assert!(!report.interrupted);
            }
            other => panic!("Unexpected outcome {other:?}"),
        }
        responder.join().unwrap();
        assert!(!d.control.disconnect.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stopped_driver_does_nothing() {
        let mut d = driver(AlwaysReady);
        d.control.running.store(false, Ordering::Relaxed);
        assert!(!d.wait_for_link());
        assert!(matches!(d.run_cycle(), CycleOutcome::Stopped));
        assert_eq!(d.cycles(), 0);
    }
}
