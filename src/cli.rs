//! Command line interface

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::info;

use crate::capture::{
    CaptureActivity, CaptureManager, HepListenInput, HepSendOutput, LiveInput, OfflineInput,
    PcapFileOutput,
};
use crate::config::Config;
use crate::dissect::link::LINKTYPE_ETHERNET;
use crate::dissect::DissectConfig;
use crate::storage::Storage;

#[derive(Parser)]
#[command(name = "sipflow")]
#[command(author, version, about = "SIP/SDP traffic analyzer: capture, dissect, correlate call flows")]
pub struct Cli {
    /// Capture interface
    #[arg(short, long)]
    pub device: Option<String>,

    /// Read packets from a capture file (repeatable)
    #[arg(short = 'I', long = "input")]
    pub inputs: Vec<PathBuf>,

    /// Write matched packets to a capture file
    #[arg(short = 'O', long = "output")]
    pub output: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum calls retained
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Only track dialogs opened by INVITE
    #[arg(long = "calls")]
    pub calls_only: bool,

    /// Payload regex pre-filter
    #[arg(short = 'R', long = "match")]
    pub match_expr: Option<String>,

    /// Listen for HEP-encapsulated frames on this address
    #[arg(short = 'L', long = "eep-listen")]
    pub eep_listen: Option<String>,

    /// Forward captured SIP over HEP to this address
    #[arg(short = 'H', long = "eep-send")]
    pub eep_send: Option<String>,

    /// TLS key file
    #[arg(short, long)]
    pub keyfile: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// BPF capture filter expression
    #[arg(trailing_var_arg = true)]
    pub filter: Vec<String>,
}

impl Cli {
    /// Merge command line overrides into the loaded configuration
    pub fn merged_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default()?,
        };
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(limit) = self.limit {
            config.capture.limit = limit;
        }
        if self.calls_only {
            config.storage.r#match.invite = true;
        }
        if let Some(expr) = &self.match_expr {
            config.storage.filter.payload = Some(expr.clone());
        }
        if let Some(listen) = &self.eep_listen {
            config.capture.eep.listen = Some(listen.clone());
        }
        if let Some(send) = &self.eep_send {
            config.capture.eep.send = Some(send.clone());
        }
        if let Some(keyfile) = &self.keyfile {
            config.tls.keyfile = Some(keyfile.clone());
        }
        Ok(config)
    }
}

fn dissect_config(config: &Config) -> DissectConfig {
    DissectConfig {
        hep_port: config
            .capture
            .eep
            .listen
            .as_deref()
            .and_then(|addr| addr.rsplit_once(':'))
            .and_then(|(_, port)| port.parse().ok()),
        tls_keyfile: config.tls.keyfile.clone(),
        tls_server: config.tls.server.as_deref().and_then(|s| s.parse().ok()),
    }
}

/// Wire config → storage → manager and run the capture
pub fn run(cli: Cli) -> Result<()> {
    let config = cli.merged_config()?;

    let storage = Arc::new(Mutex::new(Storage::new(config.storage_options())));
    let mut manager = CaptureManager::new(storage.clone(), dissect_config(&config));

    let offline_only = !cli.inputs.is_empty() && config.capture.eep.listen.is_none();
    for path in &cli.inputs {
        let path = path.to_str().context("capture file path is not valid UTF-8")?;
        manager.add_input(Box::new(OfflineInput::open(path)?));
    }
    if cli.inputs.is_empty() {
        manager.add_input(Box::new(LiveInput::open(&config.capture.device)?));
    }
    if let Some(listen) = &config.capture.eep.listen {
        manager.add_input(Box::new(HepListenInput::bind(listen)?));
    }

    if let Some(path) = &cli.output {
        let path = path.to_str().context("output file path is not valid UTF-8")?;
        manager.add_output(Box::new(PcapFileOutput::create(path, LINKTYPE_ETHERNET)?));
    }
    if let Some(send) = &config.capture.eep.send {
        manager.add_output(Box::new(HepSendOutput::connect(send, std::process::id(), None)?));
    }

    if !cli.filter.is_empty() {
        manager.set_filter(&cli.filter.join(" "))?;
    }

    manager.start();

    // Presentation poll: watch the generation counter until capture settles
    let mut last_seen = 0;
    loop {
        std::thread::sleep(Duration::from_millis(200));

        let changed = storage.lock().calls_changed();
        if changed != last_seen {
            last_seen = changed;
            let stats = storage.lock().stats();
            info!(
                total = stats.total,
                retained = stats.retained,
                displayed = stats.displayed,
                "call table updated"
            );
        }

        if offline_only && manager.status().1 != CaptureActivity::Loading {
            break;
        }
    }

    manager.stop();
    print_call_table(&storage.lock());
    Ok(())
}

fn print_call_table(storage: &Storage) {
    let stats = storage.stats();
    println!(
        "{} calls ({} displayed, {} bytes retained)",
        stats.retained, stats.displayed, stats.mem_bytes
    );
    println!(
        "{:<15} {:<32} {:<12} {:<12} {:>5} {:<10} {:>8}",
        "Start", "Call-ID", "From", "To", "Msgs", "State", "Dur(s)"
    );
    for call in storage.displayed_calls() {
        println!(
            "{:<15} {:<32} {:<12} {:<12} {:>5} {:<10} {:>8}",
            call.start_time().format("%H:%M:%S%.3f").to_string(),
            call.call_id,
            call.src_user(),
            call.dst_user(),
            call.msgcnt(),
            call.state.as_str(),
            call.totaldur_usec() / 1_000_000,
        );
    }
}
