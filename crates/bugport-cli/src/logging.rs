//! Logging initialization.

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Level for the `bugport` targets given the quiet flag and `-v` count.
pub fn level(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str, format: LogFormat) {
    // Directive targets match by prefix, so this also covers `bugport_migrate`.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("bugport={level}").into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    tracing::debug!(level = %level, format = ?format, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_flags() {
        assert_eq!(level(true, 3), "warn");
        assert_eq!(level(false, 0), "info");
        assert_eq!(level(false, 1), "debug");
        assert_eq!(level(false, 5), "trace");
    }
}
