//! Capture manager
//!
//! Owns the capture inputs and outputs and drives a single cooperative run
//! loop on a worker thread: poll every input, run the dissector chain to
//! completion for the frame, fan the packet out to the outputs and hand it
//! to storage. One frame is one atomic ingestion; per-flow reassembly state
//! lives inside the chain and is confined to the worker thread.
//!
//! The manager is a process-scoped value constructed at startup and threaded
//! explicitly through call sites; tests build their own.

pub mod input;
pub mod output;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::address::Address;
use crate::core::packet::Packet;
use crate::dissect::{DissectConfig, DissectorChain};
use crate::storage::Storage;

pub use input::{CaptureInput, CaptureMode, HepListenInput, InputPoll, LiveInput, OfflineInput, RawFrame};
pub use output::{CaptureOutput, HepSendOutput, PcapFileOutput};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open device {device}: {source}")]
    DeviceOpen { device: String, source: pcap::Error },

    #[error("failed to open capture file {path}: {source}")]
    FileOpen { path: String, source: pcap::Error },

    #[error("invalid capture filter {expr:?}: {source}")]
    Filter { expr: String, source: pcap::Error },

    #[error("failed to bind encapsulation socket {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error(transparent)]
    Pcap(#[from] pcap::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the attached inputs capture from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Online,
    Offline,
    Mixed,
}

/// What the run loop is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureActivity {
    Running,
    Loading,
    Paused,
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureStatus::Online => write!(f, "Online"),
            CaptureStatus::Offline => write!(f, "Offline"),
            CaptureStatus::Mixed => write!(f, "Mixed"),
        }
    }
}

struct ManagerInner {
    inputs: Vec<Box<dyn CaptureInput>>,
    outputs: Vec<Box<dyn CaptureOutput>>,
    filter: Option<String>,
}

/// Owns inputs, outputs and the capture worker thread
pub struct CaptureManager {
    inner: Arc<Mutex<ManagerInner>>,
    storage: Arc<Mutex<Storage>>,
    dissect_config: DissectConfig,
    keyfile: Option<PathBuf>,
    tls_server: Option<Address>,
    paused: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureManager {
    pub fn new(storage: Arc<Mutex<Storage>>, dissect_config: DissectConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                inputs: Vec::new(),
                outputs: Vec::new(),
                filter: None,
            })),
            storage,
            keyfile: dissect_config.tls_keyfile.clone(),
            tls_server: dissect_config.tls_server,
            dissect_config,
            paused: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn add_input(&self, mut input: Box<dyn CaptureInput>) {
        let mut inner = self.inner.lock();
        // new inputs inherit the manager's filter
        if let Some(filter) = inner.filter.clone() {
            if let Err(e) = input.set_filter(&filter) {
                error!(error = %e, "filter rejected by new input");
            }
        }
        inner.inputs.push(input);
    }

    pub fn add_output(&self, output: Box<dyn CaptureOutput>) {
        self.inner.lock().outputs.push(output);
    }

    /// Apply a BPF filter to every input; on any failure the manager's
    /// filter stays unset and the error is returned
    pub fn set_filter(&self, expr: &str) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock();
        for input in inner.inputs.iter_mut() {
            if let Err(e) = input.set_filter(expr) {
                inner.filter = None;
                return Err(e);
            }
        }
        inner.filter = Some(expr.to_string());
        Ok(())
    }

    pub fn filter(&self) -> Option<String> {
        self.inner.lock().filter.clone()
    }

    pub fn keyfile(&self) -> Option<&PathBuf> {
        self.keyfile.as_ref()
    }

    pub fn tls_server(&self) -> Option<Address> {
        self.tls_server
    }

    /// Spawn the worker thread running the capture loop
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let storage = self.storage.clone();
        let paused = self.paused.clone();
        let running = self.running.clone();
        let config = self.dissect_config.clone();

        self.worker = Some(std::thread::spawn(move || {
            run_loop(inner, storage, paused, running, config);
        }));
        info!("capture manager started");
    }

    /// Destroy input sources, close outputs, quit the loop and join
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let mut inner = self.inner.lock();
        inner.inputs.clear();
        for output in inner.outputs.iter_mut() {
            output.close();
        }
        inner.outputs.clear();
        info!("capture manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pause: the loop keeps running but storage rejects new packets
    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.storage.lock().set_paused(paused);
    }

    pub fn toggle_pause(&self) {
        self.pause(!self.paused.load(Ordering::SeqCst));
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Fan a packet out to every attached output
    pub fn output_packet(&self, packet: &Packet) {
        let mut inner = self.inner.lock();
        for output in inner.outputs.iter_mut() {
            output.write(packet);
        }
    }

    /// True iff every attached input captures live
    pub fn is_online(&self) -> bool {
        self.inner
            .lock()
            .inputs
            .iter()
            .all(|i| i.mode() == CaptureMode::Live)
    }

    pub fn status(&self) -> (CaptureStatus, CaptureActivity) {
        let inner = self.inner.lock();
        let online = inner.inputs.iter().filter(|i| i.mode() == CaptureMode::Live).count();
        let offline = inner.inputs.len() - online;
        let loading = inner
            .inputs
            .iter()
            .filter(|i| i.mode() == CaptureMode::Offline && !i.finished())
            .count();

        let status = if offline == 0 {
            CaptureStatus::Online
        } else if online == 0 {
            CaptureStatus::Offline
        } else {
            CaptureStatus::Mixed
        };
        let activity = if self.paused.load(Ordering::SeqCst) {
            CaptureActivity::Paused
        } else if loading > 0 {
            CaptureActivity::Loading
        } else {
            CaptureActivity::Running
        };
        (status, activity)
    }

    /// Load percentage across offline inputs, 0..=100
    pub fn load_progress(&self) -> u8 {
        let inner = self.inner.lock();
        let (mut total, mut loaded) = (0u64, 0u64);
        for input in inner.inputs.iter().filter(|i| i.mode() == CaptureMode::Offline) {
            total += input.total_size();
            loaded += input.loaded_size();
        }
        if total == 0 {
            return 100;
        }
        ((loaded * 100) / total).min(100) as u8
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// The cooperative capture loop: one pass polls every input once
fn run_loop(
    inner: Arc<Mutex<ManagerInner>>,
    storage: Arc<Mutex<Storage>>,
    paused: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    config: DissectConfig,
) {
    let mut chain = DissectorChain::new(config);

    while running.load(Ordering::SeqCst) {
        let mut produced = false;
        {
            let mut guard = inner.lock();
            let state = &mut *guard;
            let mut finished = Vec::new();

            for (idx, input) in state.inputs.iter_mut().enumerate() {
                match input.poll() {
                    Ok(InputPoll::Frame(frame)) => {
                        produced = true;
                        let mut packet = Packet::new(frame.ts_usec, frame.link_type, frame.data);
                        let extras = chain.dissect(&mut packet, frame.start);

                        for packet in std::iter::once(packet).chain(extras) {
                            let interesting = packet.sip().is_some()
                                || packet.rtp().is_some()
                                || packet.rtcp().is_some();
                            if !interesting {
                                continue;
                            }
                            // every packet delivered to storage passes the
                            // outputs on the way
                            if !paused.load(Ordering::SeqCst) {
                                for output in state.outputs.iter_mut() {
                                    output.write(&packet);
                                }
                            }
                            storage.lock().append(packet);
                        }
                    }
                    Ok(InputPoll::Timeout) => {}
                    Ok(InputPoll::Finished) => finished.push(idx),
                    Err(e) => {
                        error!(source = %input.describe(), error = %e, "input failed, detaching");
                        finished.push(idx);
                    }
                }
            }

            // offline sources self-destroy at EOF
            for idx in finished.into_iter().rev() {
                let input = state.inputs.remove(idx);
                debug!(source = %input.describe(), "input detached");
            }
        }

        if !produced {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::ProtoId;
    use crate::storage::StorageOptions;
    use crate::testing;

    /// Scripted input yielding canned frames, then finishing
    struct ScriptInput {
        frames: Vec<RawFrame>,
        mode: CaptureMode,
        total: u64,
        loaded: u64,
        filter_ok: bool,
    }

    impl ScriptInput {
        fn frames(mut frames: Vec<RawFrame>, mode: CaptureMode) -> Self {
            frames.reverse();
            let total = frames.iter().map(|f| f.data.len() as u64).sum();
            Self { frames, mode, total, loaded: 0, filter_ok: true }
        }

        fn sip(messages: &[&str], mode: CaptureMode) -> Self {
            let frames = messages
                .iter()
                .enumerate()
                .map(|(i, text)| RawFrame {
                    ts_usec: (i as u64 + 1) * 1_000,
                    link_type: 1,
                    start: ProtoId::Link,
                    data: testing::udp_frame("10.0.0.1", 5060, "10.0.0.2", 5060, text.as_bytes()),
                })
                .collect::<Vec<_>>();
            Self::frames(frames, mode)
        }
    }

    impl CaptureInput for ScriptInput {
        fn poll(&mut self) -> Result<InputPoll, CaptureError> {
            match self.frames.pop() {
                Some(frame) => {
                    self.loaded += frame.data.len() as u64;
                    Ok(InputPoll::Frame(frame))
                }
                None => Ok(InputPoll::Finished),
            }
        }

        fn set_filter(&mut self, expr: &str) -> Result<(), CaptureError> {
            if self.filter_ok {
                Ok(())
            } else {
                Err(CaptureError::Filter {
                    expr: expr.to_string(),
                    source: pcap::Error::PcapError("syntax error".into()),
                })
            }
        }

        fn mode(&self) -> CaptureMode {
            self.mode
        }

        fn total_size(&self) -> u64 {
            self.total
        }

        fn loaded_size(&self) -> u64 {
            self.loaded
        }

        fn finished(&self) -> bool {
            self.frames.is_empty()
        }

        fn describe(&self) -> String {
            "script".into()
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_manager_ingests_to_storage() {
        let storage = Arc::new(Mutex::new(Storage::new(StorageOptions::default())));
        let mut manager = CaptureManager::new(storage.clone(), DissectConfig::default());

        let invite = testing::sip_invite("mgr@x", "alice", "bob", 1, None);
        let bye = testing::sip_request("BYE", "mgr@x", "alice", "bob", 2, "");
        manager.add_input(Box::new(ScriptInput::sip(&[&invite, &bye], CaptureMode::Offline)));

        manager.start();
        wait_for(|| storage.lock().call("mgr@x").map(|c| c.msgcnt()) == Some(2));
        manager.stop();

        assert!(!manager.is_running());
        assert_eq!(storage.lock().stats().total, 1);
    }

    #[test]
    fn test_pause_drops_ingress() {
        let storage = Arc::new(Mutex::new(Storage::new(StorageOptions::default())));
        let mut manager = CaptureManager::new(storage.clone(), DissectConfig::default());
        manager.pause(true);

        let messages: Vec<String> = (0..10)
            .map(|i| testing::sip_invite(&format!("p{}@x", i), "alice", "bob", 1, None))
            .collect();
        let refs: Vec<&str> = messages.iter().map(|s| s.as_str()).collect();
        manager.add_input(Box::new(ScriptInput::sip(&refs, CaptureMode::Offline)));

        manager.start();
        wait_for(|| manager.load_progress() == 100);
        assert_eq!(storage.lock().stats().total, 0);

        manager.pause(false);
        let last = testing::sip_invite("last@x", "alice", "bob", 1, None);
        manager.add_input(Box::new(ScriptInput::sip(&[&last], CaptureMode::Offline)));
        wait_for(|| storage.lock().call("last@x").is_some());
        manager.stop();

        let stats = storage.lock().stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.retained, 1);
    }

    #[test]
    fn test_outputs_observe_all_stored_packets() {
        use std::sync::atomic::AtomicU64;

        struct CountingOutput {
            written: Arc<AtomicU64>,
        }

        impl CaptureOutput for CountingOutput {
            fn write(&mut self, _packet: &Packet) {
                self.written.fetch_add(1, Ordering::SeqCst);
            }
            fn close(&mut self) {}
            fn describe(&self) -> String {
                "count".into()
            }
        }

        let storage = Arc::new(Mutex::new(Storage::new(StorageOptions::default())));
        let mut manager = CaptureManager::new(storage.clone(), DissectConfig::default());
        let written = Arc::new(AtomicU64::new(0));
        manager.add_output(Box::new(CountingOutput { written: written.clone() }));

        let sdp = "v=0\r\nc=IN IP4 10.0.0.2\r\nm=audio 4000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\n";
        let invite = testing::sip_invite("fan@x", "alice", "bob", 1, Some(sdp));
        let mut rtp = vec![0x80, 0x00, 0x00, 0x01];
        rtp.extend_from_slice(&[0, 0, 0, 1]);
        rtp.extend_from_slice(&[0, 0, 0, 42]);
        rtp.extend_from_slice(&[0u8; 16]);

        let frames = vec![
            RawFrame {
                ts_usec: 1,
                link_type: 1,
                start: ProtoId::Link,
                data: testing::udp_frame("10.0.0.1", 5060, "10.0.0.2", 5060, invite.as_bytes()),
            },
            RawFrame {
                ts_usec: 2,
                link_type: 1,
                start: ProtoId::Link,
                data: testing::udp_frame("10.0.0.1", 4001, "10.0.0.2", 4000, &rtp),
            },
        ];
        manager.add_input(Box::new(ScriptInput::frames(frames, CaptureMode::Offline)));

        manager.start();
        wait_for(|| {
            storage
                .lock()
                .call("fan@x")
                .and_then(|c| c.streams.first().map(|s| s.packets))
                == Some(1)
        });
        manager.stop();

        // both the SIP message and the matched RTP frame passed the outputs
        assert_eq!(written.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_status_derivation() {
        let storage = Arc::new(Mutex::new(Storage::new(StorageOptions::default())));
        let manager = CaptureManager::new(storage, DissectConfig::default());

        manager.add_input(Box::new(ScriptInput::sip(&[], CaptureMode::Live)));
        assert_eq!(manager.status().0, CaptureStatus::Online);
        assert!(manager.is_online());

        manager.add_input(Box::new(ScriptInput::sip(
            &["INVITE sip:x SIP/2.0\r\nCall-ID: s@x\r\nCSeq: 1 INVITE\r\nFrom: <sip:a@b>;tag=1\r\nTo: <sip:b@c>\r\n\r\n"],
            CaptureMode::Offline,
        )));
        assert_eq!(manager.status().0, CaptureStatus::Mixed);
        assert_eq!(manager.status().1, CaptureActivity::Loading);
        assert!(!manager.is_online());

        manager.pause(true);
        assert_eq!(manager.status().1, CaptureActivity::Paused);
    }

    #[test]
    fn test_set_filter_all_or_nothing() {
        let storage = Arc::new(Mutex::new(Storage::new(StorageOptions::default())));
        let manager = CaptureManager::new(storage, DissectConfig::default());

        manager.add_input(Box::new(ScriptInput::sip(&[], CaptureMode::Live)));
        assert!(manager.set_filter("udp port 5060").is_ok());
        assert_eq!(manager.filter().as_deref(), Some("udp port 5060"));

        let mut bad = ScriptInput::sip(&[], CaptureMode::Live);
        bad.filter_ok = false;
        manager.add_input(Box::new(bad));
        assert!(manager.set_filter("bogus expr").is_err());
        assert!(manager.filter().is_none());
    }

    #[test]
    fn test_load_progress_weighted() {
        let storage = Arc::new(Mutex::new(Storage::new(StorageOptions::default())));
        let manager = CaptureManager::new(storage, DissectConfig::default());
        assert_eq!(manager.load_progress(), 100);

        let invite = testing::sip_invite("prog@x", "alice", "bob", 1, None);
        manager.add_input(Box::new(ScriptInput::sip(&[&invite], CaptureMode::Offline)));
        assert_eq!(manager.load_progress(), 0);
    }
}
