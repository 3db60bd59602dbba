//! sipflow: terminal-hosted SIP/SDP traffic analyzer core
//!
//! The capture-and-storage pipeline behind the UI: capture inputs produce
//! raw frames, the dissector chain decodes the nested protocol layers, and
//! the storage engine correlates SIP messages into call dialogs, links
//! related calls, applies filters and enforces memory bounds. The
//! presentation layer reads the store under its mutex and polls the
//! [`storage::Storage::calls_changed`] generation counter for redraws.
//!
//! Data flow: input → dissector chain → storage → presentation.

pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod dissect;
pub mod storage;
pub mod testing;

pub use capture::{CaptureError, CaptureManager};
pub use config::Config;
pub use core::{Address, Packet, Transport};
pub use storage::{Call, CallGroup, CallState, Message, Storage, StorageOptions, StorageStats};
