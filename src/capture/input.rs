//! Capture inputs: live interface, offline file, remote encapsulation
//!
//! Every input is polled by the manager's run loop and yields raw frames for
//! the dissector chain. Live devices never finish; offline files advertise
//! their size and self-destroy at EOF; the HEP listener accepts encapsulated
//! frames over UDP.

use std::net::UdpSocket;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pcap::{Active, Capture, Offline};
use tracing::{debug, info};

use crate::core::packet::ProtoId;
use crate::dissect::link::LINKTYPE_ETHERNET;
use super::CaptureError;

/// Poll granularity for live devices and sockets
const READ_TIMEOUT_MS: u64 = 50;

/// pcap on-disk per-record header size
const PCAP_RECORD_HEADER: u64 = 16;
/// pcap global header size
const PCAP_GLOBAL_HEADER: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Live,
    Offline,
}

/// One raw frame handed to the dissector chain
#[derive(Debug)]
pub struct RawFrame {
    pub ts_usec: u64,
    pub link_type: i32,
    /// Dissector the chain starts at for this frame
    pub start: ProtoId,
    pub data: Vec<u8>,
}

/// Result of polling an input once
#[derive(Debug)]
pub enum InputPoll {
    Frame(RawFrame),
    /// Nothing available right now
    Timeout,
    /// Input exhausted; the manager detaches it
    Finished,
}

/// A source of raw frames attached to the manager's run loop
pub trait CaptureInput: Send {
    fn poll(&mut self) -> Result<InputPoll, CaptureError>;

    /// Install a BPF filter; inputs without BPF support accept silently
    fn set_filter(&mut self, expr: &str) -> Result<(), CaptureError>;

    fn mode(&self) -> CaptureMode;

    /// Total bytes this input will produce (0 when unbounded)
    fn total_size(&self) -> u64;

    /// Bytes produced so far
    fn loaded_size(&self) -> u64;

    fn finished(&self) -> bool;

    /// Human-readable source name for status lines
    fn describe(&self) -> String;
}

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn header_ts_usec(header: &pcap::PacketHeader) -> u64 {
    header.ts.tv_sec as u64 * 1_000_000 + header.ts.tv_usec as u64
}

/// Live promiscuous capture from a network device
pub struct LiveInput {
    device: String,
    cap: Capture<Active>,
    link_type: i32,
    loaded: u64,
}

impl LiveInput {
    pub fn open(device: &str) -> Result<Self, CaptureError> {
        let cap = Capture::from_device(device)
            .and_then(|c| {
                c.promisc(true)
                    .snaplen(65535)
                    .timeout(READ_TIMEOUT_MS as i32)
                    .immediate_mode(true)
                    .open()
            })
            .map_err(|source| CaptureError::DeviceOpen {
                device: device.to_string(),
                source,
            })?;
        let link_type = cap.get_datalink().0;
        info!(device, link_type, "live capture opened");
        Ok(Self {
            device: device.to_string(),
            cap,
            link_type,
            loaded: 0,
        })
    }
}

impl CaptureInput for LiveInput {
    fn poll(&mut self) -> Result<InputPoll, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => {
                self.loaded += packet.data.len() as u64;
                Ok(InputPoll::Frame(RawFrame {
                    ts_usec: header_ts_usec(packet.header),
                    link_type: self.link_type,
                    start: ProtoId::Link,
                    data: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(InputPoll::Timeout),
            Err(source) => Err(CaptureError::Pcap(source)),
        }
    }

    fn set_filter(&mut self, expr: &str) -> Result<(), CaptureError> {
        self.cap
            .filter(expr, true)
            .map_err(|source| CaptureError::Filter {
                expr: expr.to_string(),
                source,
            })
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::Live
    }

    fn total_size(&self) -> u64 {
        0
    }

    fn loaded_size(&self) -> u64 {
        self.loaded
    }

    fn finished(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        self.device.clone()
    }
}

/// Offline capture file replay
pub struct OfflineInput {
    path: String,
    cap: Capture<Offline>,
    link_type: i32,
    total: u64,
    loaded: u64,
    finished: bool,
}

impl OfflineInput {
    pub fn open(path: &str) -> Result<Self, CaptureError> {
        let total = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let cap = Capture::from_file(path).map_err(|source| CaptureError::FileOpen {
            path: path.to_string(),
            source,
        })?;
        let link_type = cap.get_datalink().0;
        info!(path, total, "capture file opened");
        Ok(Self {
            path: path.to_string(),
            cap,
            link_type,
            total,
            loaded: PCAP_GLOBAL_HEADER,
            finished: false,
        })
    }
}

impl CaptureInput for OfflineInput {
    fn poll(&mut self) -> Result<InputPoll, CaptureError> {
        if self.finished {
            return Ok(InputPoll::Finished);
        }
        match self.cap.next_packet() {
            Ok(packet) => {
                self.loaded += PCAP_RECORD_HEADER + packet.data.len() as u64;
                Ok(InputPoll::Frame(RawFrame {
                    ts_usec: header_ts_usec(packet.header),
                    link_type: self.link_type,
                    start: ProtoId::Link,
                    data: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::NoMorePackets) => {
                self.finished = true;
                self.loaded = self.total;
                debug!(path = %self.path, "capture file exhausted");
                Ok(InputPoll::Finished)
            }
            Err(source) => Err(CaptureError::Pcap(source)),
        }
    }

    fn set_filter(&mut self, expr: &str) -> Result<(), CaptureError> {
        self.cap
            .filter(expr, true)
            .map_err(|source| CaptureError::Filter {
                expr: expr.to_string(),
                source,
            })
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::Offline
    }

    fn total_size(&self) -> u64 {
        self.total
    }

    fn loaded_size(&self) -> u64 {
        self.loaded.min(self.total.max(1))
    }

    fn finished(&self) -> bool {
        self.finished
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// UDP listener accepting HEP-encapsulated frames
pub struct HepListenInput {
    addr: String,
    socket: UdpSocket,
    loaded: u64,
    buf: Vec<u8>,
}

impl HepListenInput {
    pub fn bind(addr: &str) -> Result<Self, CaptureError> {
        let socket = UdpSocket::bind(addr).map_err(|source| CaptureError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)))
            .map_err(CaptureError::Io)?;
        info!(addr, "hep listener bound");
        Ok(Self {
            addr: addr.to_string(),
            socket,
            loaded: 0,
            buf: vec![0u8; 65535],
        })
    }
}

impl CaptureInput for HepListenInput {
    fn poll(&mut self) -> Result<InputPoll, CaptureError> {
        match self.socket.recv(&mut self.buf) {
            Ok(len) => {
                self.loaded += len as u64;
                Ok(InputPoll::Frame(RawFrame {
                    ts_usec: now_usec(),
                    link_type: LINKTYPE_ETHERNET,
                    start: ProtoId::Hep,
                    data: self.buf[..len].to_vec(),
                }))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(InputPoll::Timeout)
            }
            Err(source) => Err(CaptureError::Io(source)),
        }
    }

    fn set_filter(&mut self, _expr: &str) -> Result<(), CaptureError> {
        // encapsulated traffic carries no BPF attach point
        Ok(())
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::Live
    }

    fn total_size(&self) -> u64 {
        0
    }

    fn loaded_size(&self) -> u64 {
        self.loaded
    }

    fn finished(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("hep:{}", self.addr)
    }
}
