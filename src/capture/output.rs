//! Capture outputs: capture file writer and HEP forwarder
//!
//! The manager fans every packet delivered to storage out to each attached
//! output. Write errors are logged and counted, never propagated into the
//! capture loop.

use std::net::UdpSocket;

use pcap::{Capture, Linktype};
use tracing::{info, warn};

use crate::core::packet::Packet;
use crate::dissect::hep;
use super::CaptureError;

/// A sink observing packets in passing
pub trait CaptureOutput: Send {
    fn write(&mut self, packet: &Packet);

    /// Flush and release the sink
    fn close(&mut self);

    fn describe(&self) -> String;
}

/// Writes packets to a pcap capture file, bit-faithful to the original
/// timestamps and lengths
pub struct PcapFileOutput {
    path: String,
    savefile: Option<pcap::Savefile>,
    written: u64,
}

impl PcapFileOutput {
    pub fn create(path: &str, link_type: i32) -> Result<Self, CaptureError> {
        let cap = Capture::dead(Linktype(link_type)).map_err(CaptureError::Pcap)?;
        let savefile = cap.savefile(path).map_err(|source| CaptureError::FileOpen {
            path: path.to_string(),
            source,
        })?;
        info!(path, "capture output file opened");
        Ok(Self {
            path: path.to_string(),
            savefile: Some(savefile),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl CaptureOutput for PcapFileOutput {
    fn write(&mut self, packet: &Packet) {
        let savefile = match self.savefile.as_mut() {
            Some(s) => s,
            None => return,
        };
        let header = pcap::PacketHeader {
            ts: libc::timeval {
                tv_sec: (packet.ts_usec / 1_000_000) as libc::time_t,
                tv_usec: (packet.ts_usec % 1_000_000) as libc::suseconds_t,
            },
            caplen: packet.raw.len() as u32,
            len: packet.wire_len,
        };
        savefile.write(&pcap::Packet::new(&header, &packet.raw));
        self.written += 1;
    }

    fn close(&mut self) {
        if let Some(mut savefile) = self.savefile.take() {
            if let Err(e) = savefile.flush() {
                warn!(path = %self.path, error = %e, "failed to flush capture file");
            }
        }
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

impl Drop for PcapFileOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forwards packets to a remote HEP collector
pub struct HepSendOutput {
    addr: String,
    socket: UdpSocket,
    capture_id: u32,
    auth_key: Option<String>,
    sent: u64,
    errors: u64,
}

impl HepSendOutput {
    pub fn connect(addr: &str, capture_id: u32, auth_key: Option<String>) -> Result<Self, CaptureError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(CaptureError::Io)?;
        socket.connect(addr).map_err(|source| CaptureError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(addr, capture_id, "hep forwarder connected");
        Ok(Self {
            addr: addr.to_string(),
            socket,
            capture_id,
            auth_key,
            sent: 0,
            errors: 0,
        })
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl CaptureOutput for HepSendOutput {
    fn write(&mut self, packet: &Packet) {
        let envelope = match hep::encode_v3(packet, self.capture_id, self.auth_key.as_deref()) {
            Some(envelope) => envelope,
            None => return, // not a SIP packet
        };
        match self.socket.send(&envelope) {
            Ok(_) => self.sent += 1,
            Err(e) => {
                self.errors += 1;
                if self.errors == 1 {
                    warn!(addr = %self.addr, error = %e, "hep send failed");
                }
            }
        }
    }

    fn close(&mut self) {}

    fn describe(&self) -> String {
        format!("hep:{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_pcap_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let path = path.to_str().unwrap();

        let packet = testing::sip_packet(
            1_700_000_000_000_042,
            "10.0.0.1", 5060,
            "10.0.0.2", 5060,
            &testing::sip_invite("save@x", "alice", "bob", 1, None),
        );

        let mut output = PcapFileOutput::create(path, 1).unwrap();
        output.write(&packet);
        assert_eq!(output.written(), 1);
        output.close();

        let mut reader = pcap::Capture::from_file(path).unwrap();
        let read = reader.next_packet().unwrap();
        assert_eq!(read.data, packet.raw.as_slice());
        assert_eq!(read.header.ts.tv_usec as u64, 42);
        assert!(matches!(reader.next_packet(), Err(pcap::Error::NoMorePackets)));
    }

    #[test]
    fn test_hep_output_skips_non_sip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap().to_string();

        let mut output = HepSendOutput::connect(&addr, 1, None).unwrap();
        let empty = crate::core::packet::Packet::new(0, 1, vec![0u8; 32]);
        output.write(&empty);
        assert_eq!(output.sent(), 0);

        let sip = testing::sip_packet(
            5,
            "10.0.0.1", 5060,
            "10.0.0.2", 5060,
            &testing::sip_invite("fwd@x", "alice", "bob", 1, None),
        );
        output.write(&sip);
        assert_eq!(output.sent(), 1);

        let mut buf = [0u8; 65535];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"HEP3");
        assert!(len > 64);
    }
}
