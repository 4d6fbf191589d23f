//! Error classification and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type used for every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error codes surfaced to clients
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing or invalid Host header
    MissingHostHeader,
    /// Malformed request to the control plane
    BadRequest,
    /// Admission check rejected the domain
    NotAllowed,
    /// Unknown mapping
    NotFound,
    /// Unsupported method on a control-plane path
    MethodNotAllowed,
    /// The judge failed, timed out, or answered garbage
    ResolverFailed,
    /// Upstream address could not be built or the upstream is unreachable
    UpstreamUnreachable,
    /// Mapping accepted in memory but the disk write failed
    PersistenceFailed,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::NotAllowed => StatusCode::FORBIDDEN,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::ResolverFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::PersistenceFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::NotAllowed => "NOT_ALLOWED",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::ResolverFailed => "RESOLVER_FAILED",
            GatewayErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            GatewayErrorCode::PersistenceFailed => "PERSISTENCE_FAILED",
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build a response body from static or owned bytes.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Build a JSON error response carrying the code in `X-Seergate-Error`.
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Seergate-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}
