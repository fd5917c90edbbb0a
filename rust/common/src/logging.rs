use snafu::{ResultExt, Snafu};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid log filter {directive:?}"))]
    InvalidFilter {
        source: tracing_subscriber::filter::ParseError,
        directive: String,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InstallSubscriber {
        source: tracing_subscriber::util::TryInitError,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Plain,
        }
    }
}

/// Translates a `LOG_LEVEL` value into an [`EnvFilter`] directive.
///
/// Accepts the numeric verbosity used by the module (`0` error through `4` trace),
/// a level name in any case, or a full filter directive which is passed through.
pub fn filter_directive(level: &str) -> String {
    let level = level.trim();
    match level {
        "0" => "error".to_owned(),
        "1" => "warn".to_owned(),
        "2" => "info".to_owned(),
        "3" => "debug".to_owned(),
        "4" => "trace".to_owned(),
        _ => level.to_lowercase(),
    }
}

/// Installs the global subscriber.
///
/// The filter is read from `env_var`, falling back to `default_level`.
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn initialize_logging(env_var: &str, default_level: &str) -> Result<(), Error> {
    let level = std::env::var(env_var).unwrap_or_else(|_| default_level.to_owned());
    initialize_logging_with(&level, LogFormat::from_env())
}

pub fn initialize_logging_with(level: &str, format: LogFormat) -> Result<(), Error> {
    let directive = filter_directive(level);
    let filter = EnvFilter::try_new(&directive).context(InvalidFilterSnafu {
        directive: directive.clone(),
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
    .context(InstallSubscriberSnafu)
}
