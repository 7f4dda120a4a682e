//! Internal diagnostics: the global `tracing` subscriber and panic hook.

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::panic;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::{Directive, EnvFilter},
    fmt,
    prelude::*,
    registry::Registry,
};

/// Filter used when `RUST_LOG` is unset. Diagnostics stay quiet by default;
/// message logging goes to syslog, not through here.
pub const DEFAULT_FILTER: &str = "warn";

/// Output format of internal diagnostics on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TraceFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered diagnostics are lost.
pub fn init_tracing(format: TraceFormat) -> Result<WorkerGuard> {
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if let Ok(rumqttc_directive) = "rumqttc=warn".parse::<Directive>() {
        filter = filter.add_directive(rumqttc_directive);
    }

    let text_layer = (format == TraceFormat::Text).then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer.clone())
            .with_thread_ids(true)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    let json_layer = (format == TraceFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking_writer.clone())
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    let subscriber = Registry::default()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(ErrorLayer::default());

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    Ok(guard)
}

/// Route panics through tracing. Panics inside pool tasks are caught by the
/// executor after this hook has reported them.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => (*s).to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.clone(),
                None => "Unknown panic".to_string(),
            },
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        let thread = std::thread::current();
        error!(
            message = %msg,
            location = %location,
            thread = thread.name().unwrap_or("unnamed"),
            "Application panicked!"
        );
    }));
}
