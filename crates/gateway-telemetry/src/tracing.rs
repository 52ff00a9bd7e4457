//! Initialisation of the global tracing subscriber.
//!
//! ```no_run
//! use gateway_telemetry::{TelemetryOptions, Tracing};
//!
//! # fn main() -> Result<(), gateway_telemetry::tracing::Error> {
//! // The guard must be kept alive, dropping it shuts the exporters down.
//! let _tracing_guard = Tracing::new("cluster-gateway", TelemetryOptions::default()).init()?;
//! # Ok(())
//! # }
//! ```
use std::path::PathBuf;

use opentelemetry::trace::TracerProvider;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{ExporterBuildError, LogExporter, SpanExporter};
use opentelemetry_sdk::{
    Resource, logs::SdkLoggerProvider, propagation::TraceContextPropagator,
    trace::SdkTracerProvider,
};
use snafu::{ResultExt as _, Snafu};
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{Layer, Registry, layer::SubscriberExt};

use crate::settings::{FileLogSettings, LevelSettings};

type Result<T, E = Error> = std::result::Result<T, E>;
type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to install opentelemetry trace exporter"))]
    InstallOtelTraceExporter { source: ExporterBuildError },

    #[snafu(display("unable to install opentelemetry log exporter"))]
    InstallOtelLogExporter { source: ExporterBuildError },

    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// The enabled outputs and, once initialised, the OpenTelemetry providers
/// which are shut down on drop.
pub struct Tracing {
    service_name: &'static str,
    console: Option<LevelSettings>,
    file: Option<FileLogSettings>,
    otlp_logs: Option<LevelSettings>,
    otlp_traces: Option<LevelSettings>,

    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Tracing {
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";
    pub const OTEL_LOG_EXPORTER_LEVEL: &str = "OTEL_LOG_EXPORTER_LEVEL";
    pub const OTEL_TRACE_EXPORTER_LEVEL: &str = "OTEL_TRACE_EXPORTER_LEVEL";

    /// Every enabled output logs at `INFO` unless its environment variable
    /// says otherwise.
    pub fn new(service_name: &'static str, options: TelemetryOptions) -> Self {
        let TelemetryOptions {
            console_log_disabled,
            file_log_directory,
            file_log_rotation_period,
            file_log_max_files,
            otel_trace_exporter_enabled,
            otel_log_exporter_enabled,
        } = options;

        Self {
            service_name,
            console: (!console_log_disabled).then(|| LevelSettings::info(Self::CONSOLE_LOG_LEVEL)),
            file: file_log_directory.map(|directory| FileLogSettings {
                level: LevelSettings::info(Self::FILE_LOG_LEVEL),
                directory,
                rotation: file_log_rotation_period.unwrap_or_default().into(),
                max_files: file_log_max_files,
            }),
            otlp_logs: otel_log_exporter_enabled
                .then(|| LevelSettings::info(Self::OTEL_LOG_EXPORTER_LEVEL)),
            otlp_traces: otel_trace_exporter_enabled
                .then(|| LevelSettings::info(Self::OTEL_TRACE_EXPORTER_LEVEL)),
            logger_provider: None,
            tracer_provider: None,
        }
    }

    /// Installs the global subscriber. The returned value must be kept alive
    /// for as long as telemetry should be exported.
    pub fn init(mut self) -> Result<Self> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(level) = &self.console {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_filter(level.env_filter())
                    .boxed(),
            );
        }
        if let Some(file) = &self.file {
            layers.push(self.file_layer(file)?);
        }
        if let Some(level) = &self.otlp_logs {
            let (layer, provider) = self.otlp_log_layer(level)?;
            layers.push(layer);
            self.logger_provider = Some(provider);
        }
        if let Some(level) = &self.otlp_traces {
            let (layer, provider) = self.otlp_trace_layer(level)?;
            layers.push(layer);
            self.tracer_provider = Some(provider);
            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }
        Ok(self)
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name)
            .build()
    }

    fn file_layer(&self, file: &FileLogSettings) -> Result<BoxedLayer> {
        let mut appender = RollingFileAppender::builder()
            .rotation(file.rotation.clone())
            .filename_prefix(self.service_name)
            .filename_suffix(Self::FILE_LOG_SUFFIX);
        if let Some(max_files) = file.max_files {
            appender = appender.max_log_files(max_files);
        }
        let appender = appender
            .build(&file.directory)
            .context(InitRollingFileAppenderSnafu)?;

        Ok(tracing_subscriber::fmt::layer()
            .json()
            .with_writer(appender)
            .with_filter(file.level.env_filter())
            .boxed())
    }

    fn otlp_log_layer(&self, level: &LevelSettings) -> Result<(BoxedLayer, SdkLoggerProvider)> {
        let exporter = LogExporter::builder()
            .with_tonic()
            .build()
            .context(InstallOtelLogExporterSnafu)?;
        let provider = SdkLoggerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(self.resource())
            .build();

        let layer = OpenTelemetryTracingBridge::new(&provider)
            .with_filter(level.otlp_env_filter())
            .boxed();
        Ok((layer, provider))
    }

    fn otlp_trace_layer(&self, level: &LevelSettings) -> Result<(BoxedLayer, SdkTracerProvider)> {
        let exporter = SpanExporter::builder()
            .with_tonic()
            .build()
            .context(InstallOtelTraceExporterSnafu)?;
        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(self.resource())
            .build();

        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer(self.service_name))
            .with_filter(level.otlp_env_filter())
            .boxed();
        Ok((layer, provider))
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(error) = provider.shutdown() {
                tracing::error!(%error, "unable to shut down OTLP trace exporter");
            }
        }
        if let Some(provider) = &self.logger_provider {
            if let Err(error) = provider.shutdown() {
                tracing::error!(%error, "unable to shut down OTLP log exporter");
            }
        }
    }
}

/// Command line arguments controlling the telemetry outputs.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console output.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Enable logging to rolling files located in the specified DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log")
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Maximum number of log files to keep.
    #[cfg_attr(feature = "clap", arg(long, env, requires = "file_log"))]
    pub file_log_max_files: Option<usize>,

    /// Enable exporting OpenTelemetry traces via OTLP.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub otel_trace_exporter_enabled: bool,

    /// Enable exporting OpenTelemetry logs via OTLP.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub otel_log_exporter_enabled: bool,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn defaults_log_to_console_only() {
        let tracing = Tracing::new("cluster-gateway", TelemetryOptions::default());

        assert_eq!(
            tracing.console,
            Some(LevelSettings {
                environment_variable: Tracing::CONSOLE_LOG_LEVEL,
                default_level: LevelFilter::INFO,
            })
        );
        assert!(tracing.file.is_none());
        assert!(tracing.otlp_logs.is_none());
        assert!(tracing.otlp_traces.is_none());
    }

    #[test]
    fn options_enable_outputs() {
        let tracing = Tracing::new(
            "cluster-gateway",
            TelemetryOptions {
                console_log_disabled: true,
                file_log_directory: Some(PathBuf::from("/var/log/cluster-gateway")),
                file_log_rotation_period: Some(RotationPeriod::Hourly),
                file_log_max_files: Some(6),
                otel_trace_exporter_enabled: true,
                otel_log_exporter_enabled: false,
            },
        );

        assert!(tracing.console.is_none());
        assert_eq!(
            tracing.file,
            Some(FileLogSettings {
                level: LevelSettings::info(Tracing::FILE_LOG_LEVEL),
                directory: PathBuf::from("/var/log/cluster-gateway"),
                rotation: Rotation::HOURLY,
                max_files: Some(6),
            })
        );
        assert_eq!(
            tracing.otlp_traces,
            Some(LevelSettings::info(Tracing::OTEL_TRACE_EXPORTER_LEVEL))
        );
        assert!(tracing.otlp_logs.is_none());
    }

    #[rstest]
    #[case("Minutely", RotationPeriod::Minutely)]
    #[case("Never", RotationPeriod::Never)]
    fn parse_rotation_period(#[case] input: &str, #[case] expected: RotationPeriod) {
        assert_eq!(input.parse::<RotationPeriod>().unwrap(), expected);
    }
}
