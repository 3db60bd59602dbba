//! Core value types shared by capture, dissection and storage
//!
//! - [`Address`]: endpoint value type (IP, port, transport)
//! - [`Packet`]: one decoded frame with its per-protocol record table

pub mod address;
pub mod packet;

pub use address::{Address, Transport};
pub use packet::{Packet, ProtoData, ProtoId};
