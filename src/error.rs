//! Unified application error model and mapping helpers.
//! This module provides a common error enum used by the HTTP adapter and the
//! identity overlay, along with the mapping to HTTP status codes. Store-access
//! failures arrive as a typed [`StoreError`] and are classified here rather
//! than by inspecting status codes attached to generic failure objects.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Low-level failure from a backing-store call. The store client classifies
/// every transport outcome into one of these kinds; nothing is swallowed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store's access policy rejected the read or write.
    #[error("store rejected the operation: {0}")]
    Denied(String),
    /// Timeout or connectivity failure; retryable by the caller.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something we could not interpret.
    #[error("malformed store response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Forbidden { code: String, message: String },
    /// Optimistic-retry budget exhausted on a contended session.
    Contention { code: String, message: String },
    Unavailable { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Contention { code, .. }
            | AppError::Unavailable { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::Contention { message, .. }
            | AppError::Unavailable { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn contention<S: Into<String>>(code: S, msg: S) -> Self { AppError::Contention { code: code.into(), message: msg.into() } }
    pub fn unavailable<S: Into<String>>(code: S, msg: S) -> Self { AppError::Unavailable { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Forbidden { .. } => 403,
            AppError::Contention { .. } => 503,
            AppError::Unavailable { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            // Forbidden keeps the store's reason; the caller can act on it.
            StoreError::Denied(msg) => AppError::Forbidden { code: "store_denied".into(), message: msg },
            // Transient failures carry a generic message only; full detail is
            // logged where the failure was observed.
            StoreError::Unavailable(_) => AppError::Unavailable { code: "store_unavailable".into(), message: "backing store unavailable".into() },
            StoreError::Protocol(msg) => AppError::Internal { code: "store_protocol".into(), message: msg },
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal".into(), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::forbidden("forbidden", "no").http_status(), 403);
        assert_eq!(AppError::contention("busy", "contended").http_status(), 503);
        assert_eq!(AppError::unavailable("down", "later").http_status(), 503);
        assert_eq!(AppError::internal("internal", "bug").http_status(), 500);
    }

    #[test]
    fn store_error_classification() {
        let forbidden: AppError = StoreError::Denied("policy says no".into()).into();
        assert_eq!(forbidden.http_status(), 403);
        assert_eq!(forbidden.message(), "policy says no");

        let down: AppError = StoreError::Unavailable("connect refused 127.0.0.1:8890".into()).into();
        assert_eq!(down.http_status(), 503);
        // Transient detail must not leak to the caller.
        assert!(!down.message().contains("127.0.0.1"));

        let proto: AppError = StoreError::Protocol("no bindings array".into()).into();
        assert_eq!(proto.http_status(), 500);
    }

    #[test]
    fn serializes_tagged() {
        let e = AppError::user("empty_target", "no target supplied");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "user_input");
        assert_eq!(v["code"], "empty_target");
    }
}
