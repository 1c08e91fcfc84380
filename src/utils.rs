use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Duration;

use console::style;
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template("{spinner:.green} {msg} [{bar:32.cyan/blue}] {pos}/{len} steps")
        .expect("progress bar template is valid")
        .progress_chars("=>·")
});

pub(crate) fn progress_style() -> ProgressStyle {
    PROGRESS_STYLE.clone()
}

/// Installs a tracing subscriber wired through the progress bars, so that
/// phase spans and step-overflow warnings print without tearing the
/// indicatif output. The default filter keeps the framework at `info`;
/// set `RUST_LOG` to override it.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    let bars = IndicatifLayer::new();
    let writer = bars.get_stderr_writer();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pipework=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .compact(),
        )
        .with(bars)
        .try_init()
}

/// Dimmed rendering of a phase or run duration for log lines.
pub(crate) fn fmt_elapsed(elapsed: Duration) -> impl Display {
    style(format!("in {:.1?}", elapsed)).dim()
}
