//! devsim Test Harness - scenario testing for simulated devices
//!
//! This crate provides:
//! - Single-device and fleet harnesses over the in-memory broker
//! - A typed client for the HTTP control surface
//! - A TCP loopback broker speaking the wire codec, with keepalive expiry

pub mod client;
pub mod harness;
pub mod loopback;

pub use client::*;
pub use harness::*;
pub use loopback::*;
