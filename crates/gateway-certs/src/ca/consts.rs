use std::time::Duration;

use x509_cert::der::pem::LineEnding;

/// The default CA validity time span of ten years.
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// The default leaf certificate validity of 180 days.
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(180 * 24 * 60 * 60);

/// The subject of a CA generated by the gateway itself.
pub const GATEWAY_ROOT_CA_SUBJECT: &str = "CN=cluster-gateway-signer";

pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;
