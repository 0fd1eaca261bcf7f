//! Testing utilities and mock implementations
//!
//! Lets the connection be exercised against an in-memory broker, without a
//! network or an external MQTT server.

pub mod mocks;

pub use mocks::*;
