//! Device-side hub client
//!
//! [`Client`] gates every operation behind the connection lifecycle and shares one
//! conversation link per kind through a [`Multiplexer`]:
//!
//! - cloud-to-device events: fan-out
//! - desired twin updates: fan-out
//! - direct methods: registry keyed by method name

pub mod client;
pub mod mux;
pub mod twin;

pub use client::{Client, EventSubscription, TwinSubscription};
pub use mux::{DirectMethodHandler, Dispatch, FanOut, Multiplexer, Registry, Subscription};
pub use twin::TwinState;
