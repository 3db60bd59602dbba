//! Application configuration
//!
//! Loaded from a TOML file; every section and key has a default so a missing
//! file yields a usable configuration. The dotted option names consumed by
//! the core map directly to TOML paths (`storage.memory_limit`,
//! `capture.eep.listen`, ...).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dissect::sip::SipMethod;
use crate::storage::StorageOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load from the default locations, or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/sipflow/config.toml"),
            std::env::var_os("HOME")
                .map(|h| PathBuf::from(h).join(".config/sipflow/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("sipflow.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Translate the storage section into engine options
    pub fn storage_options(&self) -> StorageOptions {
        let methods = self
            .storage
            .filter
            .methods
            .iter()
            .filter_map(|name| {
                let method = SipMethod::from_token(&name.to_ascii_uppercase());
                if method.is_none() {
                    warn!(method = %name, "unknown SIP method in storage.filter.methods");
                }
                method
            })
            .collect();

        let payload_regex = self.storage.filter.payload.as_deref().and_then(|expr| {
            match Regex::new(expr) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "invalid storage.filter.payload regex, ignoring");
                    None
                }
            }
        });

        StorageOptions {
            memory_limit: self.storage.memory_limit,
            call_limit: self.capture.limit,
            methods,
            payload_regex,
            invite_only: self.storage.r#match.invite,
            complete_only: self.storage.r#match.complete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface to capture from
    #[serde(default = "default_device")]
    pub device: String,

    /// Maximum calls retained, 0 = unbounded
    #[serde(default = "default_call_limit")]
    pub limit: usize,

    #[serde(default)]
    pub eep: EepConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            limit: default_call_limit(),
            eep: EepConfig::default(),
        }
    }
}

/// Remote encapsulation endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EepConfig {
    /// Listen address for encapsulated frames, e.g. "0.0.0.0:9060"
    #[serde(default)]
    pub listen: Option<String>,

    /// Collector address packets are forwarded to
    #[serde(default)]
    pub send: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Retained memory cap in bytes, 0 = unbounded
    #[serde(default)]
    pub memory_limit: usize,

    #[serde(default)]
    pub filter: StorageFilterConfig,

    #[serde(default, rename = "match")]
    pub r#match: StorageMatchConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            filter: StorageFilterConfig::default(),
            r#match: StorageMatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageFilterConfig {
    /// SIP methods to accept, empty = all
    #[serde(default)]
    pub methods: Vec<String>,

    /// Payload regex pre-filter
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageMatchConfig {
    /// Restrict to INVITE dialogs
    #[serde(default)]
    pub invite: bool,

    /// Drop non-terminal calls on save
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the TLS key file
    #[serde(default)]
    pub keyfile: Option<PathBuf>,

    /// Endpoint known to speak SIP over TLS, "addr:port"
    #[serde(default)]
    pub server: Option<String>,
}

/// Recognized dotted option names, for the resource-file collaborator
pub fn known_options() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("storage.memory_limit", "retained memory cap in bytes, 0 = unbounded"),
        ("storage.filter.methods", "SIP methods to accept"),
        ("storage.filter.payload", "payload regex pre-filter"),
        ("storage.match.invite", "restrict to INVITE dialogs"),
        ("storage.match.complete", "drop non-terminal calls on save"),
        ("tls.keyfile", "TLS key file path"),
        ("tls.server", "TLS SIP server endpoint hint"),
        ("capture.limit", "maximum calls retained"),
        ("capture.device", "capture interface name"),
        ("capture.eep.listen", "remote encapsulation listen address"),
        ("capture.eep.send", "remote encapsulation send address"),
    ])
}

fn default_device() -> String {
    "any".to_string()
}

fn default_call_limit() -> usize {
    20000
}
