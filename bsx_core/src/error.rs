//! Error types shared by the exporter crates.

use std::io;

/// Errors raised while compiling a tube mapping configuration or
/// validating exporter settings.
///
/// Line numbers are 1-based and point at the line that made the
/// configuration invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read mapping config: {0}")]
    Io(#[from] io::Error),

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("line {line}: invalid tube pattern: {source}")]
    InvalidRegex {
        line: usize,
        #[source]
        source: regex::Error,
    },

    #[error("line {line}: expected label mapping line, got: {text}")]
    BadLabelLine { line: usize, text: String },

    #[error("line {line}: tube mapping didn't set any labels")]
    NoLabels { line: usize },

    #[error("line {line}: tube mapping didn't set a tube name")]
    MissingName { line: usize },

    #[error("line {line}: tube name '{name}' doesn't match regex '{pattern}'")]
    InvalidTubeName {
        line: usize,
        name: String,
        pattern: &'static str,
    },
}

impl ConfigError {
    /// Line the error refers to, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            ConfigError::Io(_) | ConfigError::Invalid(_) => None,
            ConfigError::InvalidRegex { line, .. }
            | ConfigError::BadLabelLine { line, .. }
            | ConfigError::NoLabels { line }
            | ConfigError::MissingName { line }
            | ConfigError::InvalidTubeName { line, .. } => Some(*line),
        }
    }
}

/// Errors raised while talking to beanstalkd or exporting what it returned.
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    #[error("{attempts} connection attempts failed, skipping current stats")]
    ConnectRetriesExhausted { attempts: u32 },

    #[error("{command}: server replied {reply}")]
    Protocol { command: String, reply: String },

    #[error("{command}: unexpected response: {response:?}")]
    UnexpectedResponse { command: String, response: String },

    #[error("malformed stats body: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ExporterError {
    /// True when the error means the peer could not be reached at all,
    /// as opposed to a reachable peer failing a request.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ExporterError::Connection(_) | ExporterError::ConnectRetriesExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
