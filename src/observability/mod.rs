//! Structured logging for the hub client

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{device_span, link_span, session_span};
