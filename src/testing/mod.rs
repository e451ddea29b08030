//! Testing utilities and mock implementations
//!
//! This module provides a scripted in-memory broker so the engine can be
//! exercised without a network or a real MQTT server.

pub mod mocks;

pub use mocks::*;
