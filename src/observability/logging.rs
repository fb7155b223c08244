//! Tracing subscriber setup for the hub client
//!
//! Library code only emits `tracing` events; installing a subscriber is left to the binary
//! (or to an embedding application that already owns one).
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: emit span open/close events when `true`
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG hubclient watch-events
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, fmt::format::FmtSpan, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Crates whose chatter is capped at warn unless `RUST_LOG` says otherwise
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc", "rustls", "tokio"];

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|krate| format!("{krate}=warn").parse::<Directive>().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let registry = tracing_subscriber::registry().with(build_filter(level));
    let spans = span_events(include_spans);

    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

/// Install the global subscriber from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span covering one AMQP session or MQTT connection
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("hub_session", $($field)*)
    };
}

/// Span covering the lifetime of one link (partition receiver, management exchange, CBS)
#[macro_export]
macro_rules! link_span {
    ($($field:tt)*) => {
        tracing::info_span!("hub_link", $($field)*)
    };
}

/// Span covering a device client operation
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_operation", $($field)*)
    };
}

pub use {device_span, link_span, session_span};
