//! Simulated DoIP entity for unit testing the protocol engine
//!
//! Requests are matched byte for byte against a request/response map. A match
//! queues the mapped response frames for the next reads. Clones share state, so
//! a test can keep a handle after moving the channel into a client.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    channel::{ChannelResult, DoipChannel, TransportError},
    frame::{self, DoipMessage},
};

#[derive(Debug, Default)]
struct SimState {
    req_resp_map: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    rx_queue: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    connected: bool,
    refuse_connect: bool,
    connects: usize,
}

/// In memory [DoipChannel]
#[derive(Debug, Clone, Default)]
pub struct SimulationChannel {
    state: Arc<Mutex<SimState>>,
}

impl SimulationChannel {
    /// Creates an empty simulation with no mapped responses
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    /// Queues `resp` frames every time exactly `req` is sent
    pub fn add_response(&self, req: &DoipMessage, resp: &[DoipMessage]) {
        self.lock()
            .req_resp_map
            .insert(req.encode(), resp.iter().map(|m| m.encode()).collect());
    }

    /// Queues raw bytes to be returned by the next read, as if sent unsolicited
    pub fn push_raw(&self, bytes: &[u8]) {
        self.lock().rx_queue.push_back(bytes.to_vec());
    }

    /// Queues a message to be returned by the next read, as if sent unsolicited
    pub fn push_message(&self, msg: &DoipMessage) {
        self.push_raw(&msg.encode());
    }

    /// Makes every following connect attempt fail
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    /// Every frame written to the channel so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Clears the response map, pending reads and the sent log
    pub fn clear(&self) {
        let mut s = self.lock();
        s.req_resp_map.clear();
        s.rx_queue.clear();
        s.sent.clear();
    }
}

impl DoipChannel for SimulationChannel {
    fn connect(&mut self, ip: IpAddr, port: u16, _timeout_ms: u32) -> ChannelResult<()> {
        let mut s = self.lock();
        if s.refuse_connect {
            return Err(TransportError::ConnectFailed(format!(
                "{ip}:{port} refused by simulation"
            )));
        }
        s.connected = true;
        s.connects += 1;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        let mut s = self.lock();
        if !s.connected {
            return Err(TransportError::NotConnected);
        }
        s.sent.push(data.to_vec());
        if let Some(resp) = s.req_resp_map.get(data).cloned() {
            s.rx_queue.extend(resp);
        }
        Ok(())
    }

    fn receive_message(&mut self, timeout_ms: u32) -> ChannelResult<DoipMessage> {
        let next = {
            let mut s = self.lock();
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            s.rx_queue.pop_front()
        };
        match next {
            Some(bytes) => {
                let decoded = frame::decode(&bytes)?;
                if !decoded.is_complete() {
                    return Err(TransportError::Malformed(frame::FrameError::Truncated {
                        len: bytes.len(),
                    }));
                }
                Ok(decoded.message)
            }
            None => {
                std::thread::sleep(Duration::from_millis(std::cmp::min(timeout_ms, 5) as u64));
                Err(TransportError::Timeout)
            }
        }
    }

    fn disconnect(&mut self) {
        self.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
