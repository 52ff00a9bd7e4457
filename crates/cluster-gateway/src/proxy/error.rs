use std::error::Error as _;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use snafu::Snafu;
use tracing::{error, warn};

use crate::{
    proxy::authz::AuthorizeError, resolver::ResolveError, store::StoreError,
    transport::TransportError,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProxyError {
    #[snafu(display("failed to resolve cluster {cluster:?}"))]
    Resolve {
        source: ResolveError,
        cluster: String,
    },

    #[snafu(display("failed to create transport for cluster {cluster:?}"))]
    BuildTransport {
        source: TransportError,
        cluster: String,
    },

    #[snafu(display("failed to proxy request to cluster {cluster:?}"))]
    Forward {
        source: TransportError,
        cluster: String,
    },

    #[snafu(display("failed to authorize proxy request"))]
    Authorize { source: AuthorizeError },

    #[snafu(display("proxying by user {user:?} is forbidden: {reason}"))]
    Forbidden { user: String, reason: String },

    #[snafu(display("invalid proxy request"))]
    InvalidRequest { source: http::Error },

    #[snafu(display("{path:?} is not a proxy request path"))]
    InvalidProxyPath { path: String },

    #[snafu(display("failed to read health of cluster {cluster:?}"))]
    ReadHealth { source: StoreError, cluster: String },
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Resolve { source, .. } if source.is_not_found() => StatusCode::NOT_FOUND,
            Self::Resolve { source, .. } if source.is_malformed() => StatusCode::BAD_GATEWAY,
            Self::Resolve { .. } | Self::Authorize { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BuildTransport { .. } => StatusCode::BAD_GATEWAY,
            Self::Forward { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Forward { .. } => StatusCode::BAD_GATEWAY,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::InvalidRequest { .. } | Self::InvalidProxyPath { .. } => StatusCode::BAD_REQUEST,
            Self::ReadHealth { source, .. } if source.is_not_found() => StatusCode::NOT_FOUND,
            Self::ReadHealth { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message with the messages of all its sources.
    pub fn message(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(error) = source {
            message.push_str(": ");
            message.push_str(&error.to_string());
            source = error.source();
        }
        message
    }
}

fn status_reason(code: StatusCode) -> &'static str {
    match code {
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::FORBIDDEN => "Forbidden",
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::GATEWAY_TIMEOUT => "Timeout",
        _ => "InternalError",
    }
}

/// Errors are returned as `Status` objects, like the API server does.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            error!(error = &self as &dyn std::error::Error, "failed to proxy request");
        } else {
            warn!(error = &self as &dyn std::error::Error, "rejected proxy request");
        }

        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.message(),
            "reason": status_reason(code),
            "code": code.as_u16(),
        });

        (code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_bad_gateway() {
        let err = ProxyError::BuildTransport {
            source: TransportError::MissingCredential {
                cluster: "c1".to_owned(),
            },
            cluster: "c1".to_owned(),
        };

        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.message().ends_with("cluster lacks any credential"), "{}", err.message());
    }

    #[test]
    fn forbidden_is_forbidden() {
        let err = ProxyError::Forbidden {
            user: "alice".to_owned(),
            reason: "no RBAC policy matched".to_owned(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn timeout_is_gateway_timeout() {
        let err = ProxyError::Forward {
            source: TransportError::Timeout {
                timeout: std::time::Duration::from_secs(40),
            },
            cluster: "c1".to_owned(),
        };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
