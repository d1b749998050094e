use std::env::var;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Read the format from `RUST_LOG_FORMAT`, defaulting to compact output.
    ///
    /// Runs before any subscriber exists, so an unset or unreadable variable
    /// silently means compact.
    pub fn from_env() -> Self {
        Self::from_value(&var("RUST_LOG_FORMAT").unwrap_or_default())
    }

    /// Map a `RUST_LOG_FORMAT` value to a format; anything but `json` is compact.
    pub fn from_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") { Self::Json } else { Self::Compact }
    }
}

/// Install the global subscriber.
///
/// `level` is the default directive (`"info"`, `"debug"`, ...). `RUST_LOG`
/// still takes precedence when set. Unknown levels fall back to `info`.
pub fn init(level: &str) {
    init_with(parse_level(level), LogFormat::from_env());
}

/// Install the global subscriber with an explicit level and format.
pub fn init_with(level: LevelFilter, format: LogFormat) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = tracing_subscriber::registry().with(log_layer).try_init();
}

fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::INFO)
}
