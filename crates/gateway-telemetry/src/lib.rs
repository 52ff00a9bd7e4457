//! Tracing subscriber setup shared by the cluster gateway binaries.
//!
//! Output can be sent to the console, to rolling JSON log files and to an
//! OpenTelemetry collector (traces and logs over OTLP/gRPC). Each output has
//! its own level filter which can be controlled by an environment variable.
//!
//! To get started, see [`Tracing`].
pub mod settings;
pub mod tracing;

pub use crate::tracing::{RotationPeriod, TelemetryOptions, Tracing};
