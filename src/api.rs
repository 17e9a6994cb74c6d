//! Shared HTTP plumbing: the JSON error envelope and small wire types
//! used by both node roles.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::AisError;

/// The JSON error envelope returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: u16,
    pub message: String,
    pub method: String,
    pub url_path: String,
    pub remote_addr: String,
    pub trace: String,
}

/// Request coordinates captured before the handler runs, so errors can
/// fill the envelope.
#[derive(Debug, Clone, Default)]
pub struct ReqMeta {
    pub method: String,
    pub url_path: String,
    pub remote_addr: String,
}

#[async_trait::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ReqMeta {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ReqMeta {
            method: parts.method.to_string(),
            url_path: parts.uri.path().to_string(),
            remote_addr: parts
                .extensions
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.to_string())
                .unwrap_or_default(),
        })
    }
}

impl ReqMeta {
    /// Wrap an error with this request's coordinates.
    pub fn err(&self, err: AisError) -> ApiError {
        ApiError {
            err,
            meta: self.clone(),
        }
    }
}

/// Handler-level error: an [`AisError`] plus the request coordinates.
#[derive(Debug)]
pub struct ApiError {
    pub err: AisError,
    pub meta: ReqMeta,
}

impl From<AisError> for ApiError {
    fn from(err: AisError) -> Self {
        Self {
            err,
            meta: ReqMeta::default(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // NotPrimary redirects instead of erroring
        if let AisError::NotPrimary { primary_url } = &self.err {
            if let Ok(location) = HeaderValue::from_str(primary_url) {
                return ([(header::LOCATION, location)], StatusCode::TEMPORARY_REDIRECT)
                    .into_response();
            }
        }

        let envelope = ErrorEnvelope {
            status: status.as_u16(),
            message: self.err.to_string(),
            method: self.meta.method,
            url_path: self.meta.url_path,
            remote_addr: self.meta.remote_addr,
            trace: format!("{:016x}", rand::random::<u64>()),
        };
        let mut resp = (status, axum::Json(envelope)).into_response();
        resp.headers_mut().insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        resp
    }
}

/// Checksum response header.
pub const HDR_CHECKSUM_TYPE: &str = "ais-checksum-type";
pub const HDR_CHECKSUM_VALUE: &str = "ais-checksum-value";
pub const HDR_OBJ_VERSION: &str = "ais-version";

/// Query parameters of the transaction endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TxnQuery {
    pub uuid: String,
    /// Per-transaction timeout, milliseconds.
    #[serde(default)]
    pub txn_timeout: Option<u64>,
    #[serde(default)]
    pub txn_event: Option<String>,
}

/// Query parameters of the xaction endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XactQueryParams {
    #[serde(default)]
    pub what: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub latest: Option<bool>,
    #[serde(default)]
    pub running: Option<bool>,
}

/// Query parameters of object listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQueryParams {
    #[serde(default)]
    pub what: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub page_marker: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub fast: Option<bool>,
    #[serde(default)]
    pub cached: Option<bool>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl ListQueryParams {
    pub fn to_select_msg(&self) -> crate::types::SelectMsg {
        crate::types::SelectMsg {
            prefix: self.prefix.clone().unwrap_or_default(),
            page_marker: self.page_marker.clone().unwrap_or_default(),
            page_size: self.page_size.unwrap_or(0),
            fast: self.fast.unwrap_or(false),
            cached: self.cached.unwrap_or(false),
            task_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let envelope = ErrorEnvelope {
            status: 404,
            message: "bucket ais://b does not exist".into(),
            method: "GET".into(),
            url_path: "/v1/buckets/b".into(),
            remote_addr: "127.0.0.1:5555".into(),
            trace: "deadbeef".into(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], 404);
        assert!(json["message"].as_str().unwrap().contains("does not exist"));
    }
}
