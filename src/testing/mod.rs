//! Testing utilities and mock implementations
//!
//! Mocks for the device transport and the AMQP broker so the clients can be tested without
//! a hub.

pub mod mocks;

pub use mocks::*;
