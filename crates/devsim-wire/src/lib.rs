//! devsim Wire Protocol - MQTT 3.1.1 packet format
//!
//! This crate implements the subset of MQTT a simulated device needs:
//! - Fixed header with variable-length remaining length
//! - CONNECT / CONNACK handshake
//! - PUBLISH, SUBSCRIBE / SUBACK
//! - PINGREQ / PINGRESP keepalive
//! - Topic filter matching (`+` and `#` wildcards)

pub mod flags;
pub mod header;
pub mod packet;
pub mod topic;

pub use flags::*;
pub use header::*;
pub use packet::*;
pub use topic::*;
