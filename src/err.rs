#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{BoxError, Json};

use serde::Serialize;

use crate::store::StoreError;

pub async fn handler404(path: Uri) -> Error {
    Error::NotFound {
        message: format!("Invalid path: {}", path),
    }
}

pub async fn handle_timeout(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        let body = Error::InternalError {
            kind: "Timeout",
            message: "Request timed out".to_string(),
        };
        return (StatusCode::REQUEST_TIMEOUT, Json(body)).into_response();
    }
    log::error!("unhandled middleware error: {}", err);
    Error::InternalError {
        kind: "Unknown",
        message: "Internal failure".to_string(),
    }
    .into_response()
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    /// Entity is absent, or exists outside the caller's scope.
    NotFound { message: String },
    ValidationError {
        message: String,
        fields: Vec<FieldError>,
    },
    Conflict { message: String },
    CapacityExceeded { message: String, limit: usize },
    Unauthenticated { message: String },
    StoreUnavailable { message: String },
    InternalError { kind: &'static str, message: String },
}

impl Error {
    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Error {
        Error::Conflict {
            message: msg.into(),
        }
    }

    pub fn unauthenticated() -> Error {
        Error::Unauthenticated {
            message: "No authenticated tutor, student or parent token".to_string(),
        }
    }

    pub fn invalid(fields: Vec<FieldError>) -> Error {
        let names: Vec<&str> = fields.iter().map(|f| f.field).collect();
        Error::ValidationError {
            message: format!("Invalid fields: {}", names.join(", ")),
            fields,
        }
    }

    pub fn invalid_field<S: Into<String>>(field: &'static str, msg: S) -> Error {
        Error::invalid(vec![FieldError {
            field,
            message: msg.into(),
        }])
    }

    pub fn capacity_exceeded(limit: usize) -> Error {
        Error::CapacityExceeded {
            message: format!("Active student limit of {} reached", limit),
            limit,
        }
    }

    /// Machine-readable kind, identical to the `error` tag in the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::ValidationError { .. } => "ValidationError",
            Error::Conflict { .. } => "Conflict",
            Error::CapacityExceeded { .. } => "CapacityExceeded",
            Error::Unauthenticated { .. } => "Unauthenticated",
            Error::StoreUnavailable { .. } => "StoreUnavailable",
            Error::InternalError { .. } => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::CapacityExceeded { .. } => StatusCode::FORBIDDEN,
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Error::Conflict { message },
            StoreError::Capacity(denial) => Error::capacity_exceeded(denial.limit),
            StoreError::Missing(what) => Error::not_found(format!("{} not found", what)),
            StoreError::Unavailable(details) => {
                log::error!("record store unavailable: {}", details);
                Error::StoreUnavailable {
                    message: "Record store is temporarily unavailable".to_string(),
                }
            }
            StoreError::Internal(details) => {
                log::error!("record store failure: {}", details);
                Error::InternalError {
                    kind: "DatabaseError",
                    message: "Internal failure".to_string(),
                }
            }
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        log::error!("unexpected failure: {:?}", err);
        Self::InternalError {
            kind: "Unknown",
            message: "Internal failure".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::Denial;

    #[test]
    fn store_errors_never_leak_details() {
        let err = Error::from(StoreError::Internal("relation \"students\" secret".into()));
        let body = serde_json::to_string(&err).unwrap();
        assert!(!body.contains("secret"));
        assert_eq!(err.kind(), "InternalError");
    }

    #[test]
    fn capacity_denial_keeps_limit() {
        let err = Error::from(StoreError::Capacity(Denial::capacity_exceeded(20)));
        assert_eq!(err, Error::capacity_exceeded(20));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let body = serde_json::to_value(&err).unwrap();
        assert_eq!(body["error"], "CapacityExceeded");
        assert_eq!(body["limit"], 20);
    }

    #[test]
    fn validation_lists_fields() {
        let err = Error::invalid(vec![
            FieldError {
                field: "full_name",
                message: "must not be blank".into(),
            },
            FieldError {
                field: "year",
                message: "must not be blank".into(),
            },
        ]);
        match err {
            Error::ValidationError { message, fields } => {
                assert_eq!(message, "Invalid fields: full_name, year");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
