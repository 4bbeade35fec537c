use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::store::access_log::{
    REASON_DELETED, REASON_EXHAUSTED, REASON_EXPIRED, REASON_INACTIVE, REASON_INTERNAL,
    REASON_INVALID_PASSWORD, REASON_NOT_FOUND, REASON_PAYLOAD_MISSING,
};

/// Why a secret that exists can no longer be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    Deleted,
    Expired,
    Inactive,
    Exhausted,
}

impl GoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => REASON_DELETED,
            Self::Expired => REASON_EXPIRED,
            Self::Inactive => REASON_INACTIVE,
            Self::Exhausted => REASON_EXHAUSTED,
        }
    }
}

impl std::fmt::Display for GoneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a redemption attempt.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("secret not found")]
    NotFound,

    #[error("secret is gone: {0}")]
    Gone(GoneReason),

    #[error("invalid password")]
    Forbidden,

    #[error("secret {0} has metadata but no payload")]
    IntegrityViolation(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AccessError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::IntegrityViolation(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Failure reason recorded in the access log.
    pub fn log_reason(&self) -> &'static str {
        match self {
            Self::NotFound => REASON_NOT_FOUND,
            Self::Gone(reason) => reason.as_str(),
            Self::Forbidden => REASON_INVALID_PASSWORD,
            Self::IntegrityViolation(_) => REASON_PAYLOAD_MISSING,
            Self::Internal(_) => REASON_INTERNAL,
        }
    }
}

/// Failure of a single cache backend call.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Rejection of a secret creation request.
#[derive(Error, Debug)]
pub enum CreateError {
    #[error("daily creation limit of {limit} reached")]
    QuotaExceeded { limit: u32 },

    #[error("content is {size} characters, plan allows {max}")]
    ContentTooLong { size: usize, max: usize },

    #[error("file is {size} bytes, plan allows {max}")]
    FileTooLarge { size: usize, max: usize },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CreateError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ContentTooLong { .. } | Self::FileTooLarge { .. } | Self::Invalid(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure of an owner-scoped operation (password update, logs, delete).
#[derive(Error, Debug)]
pub enum OwnerError {
    #[error("secret not found")]
    NotFound,

    #[error("not the owner of this secret")]
    NotOwner,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OwnerError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotOwner => StatusCode::FORBIDDEN,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_errors_map_to_statuses_and_reasons() {
        let cases = [
            (AccessError::NotFound, StatusCode::NOT_FOUND, "not found"),
            (
                AccessError::Gone(GoneReason::Exhausted),
                StatusCode::GONE,
                "max views reached",
            ),
            (
                AccessError::Gone(GoneReason::Expired),
                StatusCode::GONE,
                "expired",
            ),
            (AccessError::Forbidden, StatusCode::FORBIDDEN, "invalid password"),
            (
                AccessError::IntegrityViolation("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "payload missing",
            ),
        ];
        for (err, status, reason) in cases {
            assert_eq!(err.http_status(), status, "{err}");
            assert_eq!(err.log_reason(), reason);
        }
    }

    #[test]
    fn create_quota_is_429() {
        let err = CreateError::QuotaExceeded { limit: 10 };
        assert_eq!(err.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.to_string(), "daily creation limit of 10 reached");
    }
}
