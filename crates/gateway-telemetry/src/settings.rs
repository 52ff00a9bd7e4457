//! Per-output subscriber settings.
use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::{EnvFilter, filter::Directive};

/// The level filter of one output: `default_level`, unless the environment
/// variable holds an [`EnvFilter`] directive.
#[derive(Debug, PartialEq)]
pub struct LevelSettings {
    pub environment_variable: &'static str,
    pub default_level: LevelFilter,
}

impl LevelSettings {
    pub const fn info(environment_variable: &'static str) -> Self {
        Self {
            environment_variable,
            default_level: LevelFilter::INFO,
        }
    }

    pub(crate) fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_env_var(self.environment_variable)
            .with_default_directive(Directive::from(self.default_level))
            .from_env_lossy()
    }

    /// The exporters talk gRPC themselves; traces of `h2` would feed back
    /// into them.
    pub(crate) fn otlp_env_filter(&self) -> EnvFilter {
        let env_filter = self.env_filter();
        match "h2=off".parse::<Directive>() {
            Ok(directive) => env_filter.add_directive(directive),
            Err(_) => env_filter,
        }
    }
}

/// Settings of the rolling JSON file output.
#[derive(Debug, PartialEq)]
pub struct FileLogSettings {
    pub level: LevelSettings,
    pub directory: PathBuf,
    pub rotation: Rotation,
    pub max_files: Option<usize>,
}
