use std::fmt::Display;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Overall progress of a workflow run.
pub(crate) fn get_style_run() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Spinner for a single running task.
pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}

/// Install a `tracing` subscriber that prints through the progress bars.
///
/// The filter is taken from `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_styles_compile() {
        assert!(get_style_run().is_ok());
        assert!(get_style_task().is_ok());
    }

    #[test]
    fn test_overhead_format() {
        let text = as_overhead(Instant::now()).to_string();
        assert!(text.contains("(+"));
        assert!(text.contains("ms)"));
    }
}
