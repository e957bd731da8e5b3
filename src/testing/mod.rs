//! Testing utilities and mock implementations
//!
//! Mocks for the broker transport and the fan-out bus so the relay can be
//! tested without an MQTT broker or a browser.

pub mod mocks;

pub use mocks::*;
