//! devsim Core - Fundamental types for a simulated pub/sub device
//!
//! This crate defines the types shared by every other devsim crate:
//! - Device identity and its topic namespace
//! - Network and failure profiles (immutable simulation knobs)
//! - Retry policy for the connection supervisor
//! - The JSON message exchanged over the broker
//! - Error taxonomy

pub mod error;
pub mod id;
pub mod message;
pub mod profile;
pub mod time;

pub use error::*;
pub use id::*;
pub use message::*;
pub use profile::*;
pub use time::*;
