//! Response envelopes and the error type every handler returns.
//!
//! Successful responses are wrapped as `{ok: true, data, meta}` and errors as
//! `{ok: false, error: {code, message, details}}`. Extraction failures (bad
//! JSON, unparsable ids in the path or query string) come back through the
//! same error envelope instead of axum's plain-text rejections.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{FromRequest, FromRequestParts},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use ledger_domain::now_millis;
use ledger_engine::LedgerError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Fresh request id: `req_` followed by a UUIDv7 in simple form
pub fn request_id() -> String {
    format!("req_{}", uuid::Uuid::now_v7().simple())
}

/// Request metadata attached to every success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Request id
    pub request_id: String,
    /// Server time (Unix ms)
    pub timestamp: u64,
}

impl Meta {
    fn fresh() -> Self {
        Self {
            request_id: request_id(),
            timestamp: now_millis(),
        }
    }
}

/// Machine-readable failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable wire code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Structured evidence; `null` when there is none
    pub details: serde_json::Value,
}

/// Wire envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Whether the request succeeded
    pub ok: bool,

    /// Payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    /// Request metadata on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,

    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Envelope<T> {
    /// Success envelope around `data`
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            meta: Some(Meta::fresh()),
            error: None,
        }
    }

    /// Failure envelope
    pub fn failure(error: ErrorBody) -> Self {
        Self {
            ok: false,
            data: None,
            meta: None,
            error: Some(error),
        }
    }
}

/// Successful handler output, rendered as a success envelope
#[derive(Debug)]
pub struct ApiResponse<T>(pub T);

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(Envelope::success(self.0))).into_response()
    }
}

/// Handler result
pub type ApiResult<T> = Result<ApiResponse<T>, AppError>;

/// Application error type
#[derive(Debug)]
pub enum AppError {
    /// Error raised by the ledger
    Ledger(LedgerError),
    /// Request could not be understood
    BadRequest(String),
}

/// HTTP status for a ledger error
pub fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::InvalidOperation(_) | LedgerError::UnknownActor(_) => StatusCode::BAD_REQUEST,
        LedgerError::ConstraintHardFail { .. }
        | LedgerError::TradeoffRequired { .. }
        | LedgerError::ConflictUnresolved { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::VersionConflict { .. }
        | LedgerError::InvalidTransition(_)
        | LedgerError::LineageViolation(_) => StatusCode::CONFLICT,
        LedgerError::MutationExpired(_) => StatusCode::GONE,
        LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Ledger(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!(code = err.code(), "Request failed: {}", err);
                } else {
                    debug!(code = err.code(), "Request rejected: {}", err);
                }
                (
                    status,
                    ErrorBody {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        details: err.details(),
                    },
                )
            }
            AppError::BadRequest(message) => {
                debug!("Malformed request: {}", message);
                (
                    StatusCode::BAD_REQUEST,
                    ErrorBody {
                        code: "INVALID_OPERATION".to_string(),
                        message,
                        details: serde_json::Value::Null,
                    },
                )
            }
        };

        (status, Json(Envelope::<()>::failure(body))).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        AppError::Ledger(e)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// JSON body extractor answering with the error envelope
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Path extractor answering with the error envelope
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

/// Query string extractor answering with the error envelope
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_domain::{MutationId, StoreError};

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), 4 + 32);
        assert_ne!(id, request_id());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&LedgerError::not_found("organism", "org_x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&LedgerError::UnknownActor("mallory".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&LedgerError::ConflictUnresolved { conflict_ids: vec![] }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&LedgerError::LineageViolation("rewrite".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&LedgerError::MutationExpired(MutationId::new())),
            StatusCode::GONE
        );
        assert_eq!(
            status_for(&LedgerError::Store(StoreError::Poisoned)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_success_envelope_shape() {
        let json = serde_json::to_value(Envelope::success(vec![1, 2])).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["data"], serde_json::json!([1, 2]));
        assert!(json["meta"]["requestId"].as_str().unwrap().starts_with("req_"));
        assert!(json["meta"]["timestamp"].as_u64().is_some());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failure_envelope_shape() {
        let body = ErrorBody {
            code: "NOT_FOUND".into(),
            message: "missing".into(),
            details: serde_json::json!({"kind": "claim"}),
        };
        let json = serde_json::to_value(Envelope::<()>::failure(body)).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["details"]["kind"], "claim");
        assert!(json.get("data").is_none());
        assert!(json.get("meta").is_none());
    }
}
