use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

/// Output format of the log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "logfmt" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid(format!("unknown log format '{other}'"))),
        }
    }
}

/// Translate a `--log.level` value into an env filter directive.
///
/// `warning` and `fatal` are accepted as aliases for `warn` and `error`.
pub fn level_directive(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "fatal" | "panic" => Ok("error"),
        other => Err(ConfigError::Invalid(format!("unknown log level '{other}'"))),
    }
}

/// Build the filter: `RUST_LOG` wins when set, otherwise the given level.
pub fn env_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    let directive = level_directive(level)?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
}

/// Initialize logging for the exporter process
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), ConfigError> {
    let filter = env_filter(level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| ConfigError::Invalid(format!("logging already initialized: {e}")))
}

/// Initialize logging for tests (ignores a subscriber that is already set)
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_aliases() {
        assert_eq!(level_directive("warning").unwrap(), "warn");
        assert_eq!(level_directive("Info").unwrap(), "info");
        assert_eq!(level_directive("fatal").unwrap(), "error");
        assert!(level_directive("loud").is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_test_logging_twice() {
        init_test_logging();
        init_test_logging();
    }
}
