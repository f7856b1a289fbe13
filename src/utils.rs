use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::provenance::LogCapture;

/// Installs the global `tracing` subscriber.
///
/// Human-readable output goes to stderr through an [`IndicatifLayer`], so log
/// lines and stage progress bars do not tear each other apart. A second,
/// uncoloured layer feeds [`LogCapture::global`], which provenance logs are
/// cut from. The filter defaults to `info` and honours `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging() -> bool {
    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(LogCapture::global().clone()),
        )
        .with(indicatif_layer)
        .try_init()
        .is_ok()
}

pub(crate) fn get_style_pipeline() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .map(|style| style.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub(crate) fn get_style_task() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
