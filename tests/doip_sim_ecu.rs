use std::{
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use doip_client::{
    channel::DoipChannel,
    client::{ClientState, IncomingEvent},
    driver::{AlwaysReady, CycleOutcome, CycleSettings, CyclicDriver},
    frame::{self, DoipMessage, PayloadType, HEADER_SIZE},
    transport::{
        blocking::BlockingTcpChannel,
        event::{EventChannel, ThreadedTcpStack},
    },
    ConnectError, DiagError, DoipClient, DoipClientSettings,
};

const VIN: &[u8; 17] = b"1HGCM82633A004352";
const ECU_ADDRESS: u16 = 0x0E80;
const TESTER: u16 = 0x0E80;

type UdsHandler = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct EcuConfig {
    activation_code: u8,
    /// Send an alive check request after answering one
    ping_back: bool,
    on_uds: UdsHandler,
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            activation_code: 0x10,
            ping_back: false,
            on_uds: Arc::new(default_uds),
        }
    }
}

fn default_uds(req: &[u8]) -> Option<Vec<u8>> {
    let value: &[u8] = match req {
        [0x22, 0xF1, 0x90] => b"W0L000051T2123456",
        [0x22, 0xF1, 0xA0] => b"SW-4.2.0\0\0",
        [0x22, 0xF1, 0xA1] => b"HW-B3   ",
        [sid, ..] => return Some(vec![0x7F, *sid, 0x31]),
        [] => return None,
    };
    let mut resp = vec![req[0] + 0x40, req[1], req[2]];
    resp.extend_from_slice(value);
    Some(resp)
}

/// Simulated DoIP entity: UDP announcement responder plus a TCP server on loopback
pub struct DoipSimEcu {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    running: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<PayloadType>>>,
    threads: Vec<JoinHandle<()>>,
}

impl DoipSimEcu {
    pub fn start(config: EcuConfig) -> Self {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        tcp.set_nonblocking(true).unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let tcp_addr = tcp.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let received = Arc::new(Mutex::new(Vec::new()));

        let r = running.clone();
        let udp_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            while r.load(Ordering::Relaxed) {
                if let Ok((len, from)) = udp.recv_from(&mut buf) {
                    let req = frame::decode(&buf[..len]).unwrap().message;
                    if req.kind() == PayloadType::VehicleIdentificationRequest {
                        let mut p = VIN.to_vec();
                        p.extend_from_slice(&ECU_ADDRESS.to_be_bytes());
                        p.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
                        p.extend_from_slice(&[0x00, 0x00, 0x00]);
                        let resp = DoipMessage::new(PayloadType::VehicleIdentificationResponse, &p).unwrap();
                        udp.send_to(&resp.encode(), from).unwrap();
                    }
                }
            }
        });

        let r = running.clone();
        let rx_log = received.clone();
        let tcp_thread = std::thread::spawn(move || {
            while r.load(Ordering::Relaxed) {
                match tcp.accept() {
                    Ok((stream, _)) => serve(stream, &config, &r, &rx_log),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5))
                    }
                    Err(e) => panic!("accept failed: {e}"),
                }
            }
        });

        Self {
            udp_addr,
            tcp_addr,
            running,
            received,
            threads: vec![udp_thread, tcp_thread],
        }
    }

    pub fn client_settings(&self) -> DoipClientSettings {
        DoipClientSettings {
            discovery_address: self.udp_addr,
            tcp_port: self.tcp_addr.port(),
            discovery_timeout_ms: 1000,
            tcp_timeout_ms: 1000,
            diag_timeout_ms: 1000,
            ..Default::default()
        }
    }

    pub fn received(&self) -> Vec<PayloadType> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for DoipSimEcu {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn reply(stream: &mut TcpStream, pt: PayloadType, payload: &[u8]) {
    let msg = DoipMessage::new(pt, payload).unwrap();
    stream.write_all(&msg.encode()).unwrap();
}

fn serve(mut stream: TcpStream, cfg: &EcuConfig, running: &AtomicBool, log: &Mutex<Vec<PayloadType>>) {
    stream.set_nonblocking(false).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
    let ecu = ECU_ADDRESS.to_be_bytes();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];
    while running.load(Ordering::Relaxed) {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(_) => return,
        }
        while buf.len() >= HEADER_SIZE {
            let decoded = frame::decode(&buf).unwrap();
            if !decoded.is_complete() {
                break;
            }
            let msg = decoded.message;
            buf.drain(..HEADER_SIZE + msg.data().len());
            log.lock().unwrap().push(msg.kind());
            let data = msg.data().to_vec();
            match msg.kind() {
                PayloadType::RoutingActivationRequest => {
                    reply(
                        &mut stream,
                        PayloadType::RoutingActivationResponse,
                        &[data[0], data[1], ecu[0], ecu[1], cfg.activation_code, 0, 0, 0, 0],
                    );
                }
                PayloadType::DiagnosticMessage => {
                    reply(
                        &mut stream,
                        PayloadType::DiagnosticMessagePositiveAck,
                        &[ecu[0], ecu[1], data[0], data[1], 0x00],
                    );
                    if let Some(resp) = (cfg.on_uds)(&data[4..]) {
                        let mut p = vec![ecu[0], ecu[1], data[0], data[1]];
                        p.extend_from_slice(&resp);
                        reply(&mut stream, PayloadType::DiagnosticMessage, &p);
                    }
                }
                PayloadType::AliveCheckRequest => {
                    reply(&mut stream, PayloadType::AliveCheckResponse, &ecu);
                    if cfg.ping_back {
                        reply(&mut stream, PayloadType::AliveCheckRequest, &ecu);
                    }
                }
                _ => {}
            }
        }
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_session<C: DoipChannel>(client: &mut DoipClient<C>) {
    let vehicle = client.discover(1000).unwrap();
    assert_eq!(vehicle.vin, "1HGCM82633A004352");
    assert_eq!(vehicle.logical_address, 0x0E80);
    assert_eq!(vehicle.entity_id, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
    assert_eq!(vehicle.ip_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(client.state(), ClientState::Discovered);

    client.connect_and_activate(&vehicle, 1000).unwrap();
    assert_eq!(client.state(), ClientState::Activated);

    assert_eq!(client.read_vin().unwrap(), "W0L000051T2123456");
    assert_eq!(client.read_software_version().unwrap(), "SW-4.2.0");
    assert_eq!(client.read_hardware_version().unwrap(), "HW-B3");
    match client.read_data_by_identifier(0x1234u16) {
        Err(DiagError::ECUError { code: 0x31, .. }) => {}
        other => panic!("Unexpected result {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Activated);

    client.disconnect();
    assert_eq!(client.state(), ClientState::Idle);
    assert_eq!(client.vehicle_info().map(|v| v.vin.as_str()), Some("1HGCM82633A004352"));
}

#[test]
pub fn test_blocking_backend_session() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig::default());
    let mut client = DoipClient::new(BlockingTcpChannel::new(), ecu.client_settings());
    run_session(&mut client);
    let rx = ecu.received();
    assert_eq!(rx[0], PayloadType::RoutingActivationRequest);
    assert_eq!(rx.iter().filter(|p| **p == PayloadType::DiagnosticMessage).count(), 4);
}

#[test]
pub fn test_event_backend_session() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig::default());
    let channel = EventChannel::new(ThreadedTcpStack::new());
    let mut client = DoipClient::new(channel, ecu.client_settings());
    run_session(&mut client);
    assert_eq!(client.channel().dropped_bytes(), 0);
}

#[test]
pub fn test_event_backend_small_rx_chunks() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig::default());
    let channel = EventChannel::new(ThreadedTcpStack::new().with_rx_chunk(3));
    let mut client = DoipClient::new(channel, ecu.client_settings());
    run_session(&mut client);
}

#[test]
pub fn test_activation_denied() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig {
        activation_code: 0x06,
        ..Default::default()
    });
    let mut client = DoipClient::new(BlockingTcpChannel::new(), ecu.client_settings());
    let vehicle = client.discover(1000).unwrap();
    match client.connect_and_activate(&vehicle, 1000) {
        Err(ConnectError::ActivationDenied { code: 0x06 }) => {}
        other => panic!("Unexpected result {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Error);
    assert!(!client.channel().is_connected());

    // Nothing may be sent outside of Activated
    let before = ecu.received().len();
    assert!(matches!(
        client.diagnostic_request(0x22, 0xF190, 100),
        Err(DiagError::NotActivated(ClientState::Error))
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ecu.received().len(), before);
}

#[test]
pub fn test_connect_refused() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig::default());
    let mut settings = ecu.client_settings();
    // Nothing listens on the UDP port's number over TCP
    settings.tcp_port = ecu.udp_addr.port();
    let mut client = DoipClient::new(BlockingTcpChannel::new(), settings);
    let vehicle = client.discover(1000).unwrap();
    assert!(matches!(
        client.connect_and_activate(&vehicle, 500),
        Err(ConnectError::Transport(_))
    ));
    assert_eq!(client.state(), ClientState::Error);
}

#[test]
pub fn test_alive_check_exchange() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig {
        ping_back: true,
        ..Default::default()
    });
    let mut client = DoipClient::new(BlockingTcpChannel::new(), ecu.client_settings());
    let vehicle = client.discover(1000).unwrap();
    client.connect_and_activate(&vehicle, 1000).unwrap();
    client.send_alive_check_request().unwrap();

    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while events.len() < 2 && Instant::now() < deadline {
        if let Ok(msg) = client.receive_message(100) {
            events.push(client.dispatch(&msg).unwrap());
        }
    }
    assert_eq!(
        events,
        vec![
            IncomingEvent::AliveCheckResponse {
                source_address: Some(0x0E80)
            },
            IncomingEvent::AliveCheckRequest { answered: true },
        ]
    );
    // Our echo reaches the ECU
    let deadline = Instant::now() + Duration::from_secs(1);
    while !ecu.received().contains(&PayloadType::AliveCheckResponse) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(ecu.received().contains(&PayloadType::AliveCheckResponse));
}

fn fast_cycle() -> CycleSettings {
    CycleSettings {
        startup_delay_ms: 0,
        address_retry_ms: 10,
        link_retry_ms: 10,
        stabilization_ms: 0,
        diag_pause_ms: 10,
        listen_window_ms: 200,
        listen_poll_ms: 20,
        cycle_interval_ms: 50,
    }
}

#[test]
pub fn test_driver_cycle() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig {
        ping_back: true,
        ..Default::default()
    });
    let client = DoipClient::new(BlockingTcpChannel::new(), ecu.client_settings());
    let mut driver = CyclicDriver::new(client, AlwaysReady, fast_cycle());
    match driver.run_cycle() {
        CycleOutcome::Completed { vehicle, report } => {
            assert_eq!(vehicle.logical_address, ECU_ADDRESS);
            assert_eq!(report.vin.as_deref(), Some("W0L000051T2123456"));
            assert_eq!(report.software_version.as_deref(), Some("SW-4.2.0"));
            assert_eq!(report.hardware_version.as_deref(), Some("HW-B3"));
            assert!(report.alive_check_sent);
            assert!(!report.interrupted);
            assert!(report
                .events
                .contains(&IncomingEvent::AliveCheckRequest { answered: true }));
        }
        other => panic!("Unexpected outcome {other:?}"),
    }
    assert_eq!(driver.cycles(), 1);
    assert_eq!(driver.client().state(), ClientState::Idle);
}

#[test]
pub fn test_driver_survives_missing_vehicle() {
    init_logger();
    // Bound, silent socket: discovery always times out
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let settings = DoipClientSettings {
        discovery_address: silent.local_addr().unwrap(),
        discovery_timeout_ms: 20,
        ..Default::default()
    };
    let client = DoipClient::new(BlockingTcpChannel::new(), settings);
    let handle = CyclicDriver::new(client, AlwaysReady, fast_cycle()).spawn().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.cycles() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(handle.cycles() >= 3);
    assert!(handle.vehicle_info().is_none());
    handle.stop();
}

#[test]
pub fn test_driver_spawn_and_stop() {
    init_logger();
    let ecu = DoipSimEcu::start(EcuConfig::default());
    let client = DoipClient::new(
        EventChannel::new(ThreadedTcpStack::new()),
        ecu.client_settings(),
    );
    let handle = CyclicDriver::new(client, AlwaysReady, fast_cycle()).spawn().unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while handle.vehicle_info().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let info = handle.vehicle_info().unwrap();
    assert_eq!(info.vin, "1HGCM82633A004352");
    handle.request_disconnect();
    handle.stop();
}
