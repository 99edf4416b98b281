//! Plane-aware logging.
//!
//! Every event is routed by its `target`:
//!
//! | Target | Content | Sink |
//! |--------|---------|------|
//! | [`DATA_PLANE`] | dispatch decisions (`forwarding`, `serving`, 404/501/502...) | `data_plane_logger.output` |
//! | [`CONTROL_PLANE`] | trust decisions (certificate selection, revocation, CA/CRL load) | `control_plane_logger.output` |
//! | anything else | system log | stderr/stdout via the global format |
//!
//! Call sites pick the plane with `info!(target: DATA_PLANE, ...)`. Without an
//! installed subscriber the macros are no-ops, so components log freely in
//! unit tests.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Subscriber;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Target of request dispatch events.
pub const DATA_PLANE: &str = "data_plane";

/// Target of certificate and trust events.
pub const CONTROL_PLANE: &str = "control_plane";

/// Outputs of the two planes, as configured.
#[derive(Debug, Clone, Copy)]
pub struct PlaneOutputs<'a> {
    /// `data_plane_logger.output`
    pub data: &'a str,
    /// `control_plane_logger.output`
    pub control: &'a str,
}

impl Default for PlaneOutputs<'_> {
    fn default() -> Self {
        Self {
            data: "stdout",
            control: "stdout",
        }
    }
}

/// Setup tracing/logging
///
/// `level` is used when `RUST_LOG` is unset. `format` selects `json` or text
/// for the system log; plane sinks are always text.
///
/// # Errors
///
/// Returns `Error::Config` if a plane file cannot be opened, and
/// `Error::Internal` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>, planes: PlaneOutputs<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let system = match format {
        Some("json") => fmt::layer().json().with_filter(filter_fn(is_system)).boxed(),
        _ => fmt::layer().with_filter(filter_fn(is_system)).boxed(),
    };

    let layers = vec![
        system,
        plane_layer(DATA_PLANE, planes.data)?,
        plane_layer(CONTROL_PLANE, planes.control)?,
    ];

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}

fn is_system(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() != DATA_PLANE && metadata.target() != CONTROL_PLANE
}

fn plane_layer<S>(plane: &'static str, output: &str) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    Ok(fmt::layer()
        .with_writer(open_sink(output)?)
        .with_ansi(false)
        .with_filter(filter_fn(move |metadata| metadata.target() == plane))
        .boxed())
}

/// Writer for `stdout`, `stderr`, or an appended file.
///
/// # Errors
///
/// Returns `Error::Config` if the file cannot be opened.
pub fn open_sink(output: &str) -> Result<BoxMakeWriter> {
    match output {
        "" | "stdout" => Ok(BoxMakeWriter::new(std::io::stdout)),
        "stderr" => Ok(BoxMakeWriter::new(std::io::stderr)),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Cannot open log file '{path}': {e}")))?;
            Ok(BoxMakeWriter::new(Arc::new(file)))
        }
    }
}
