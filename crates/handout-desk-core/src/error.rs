//! Domain error kinds.
//!
//! Every fallible operation returns [`anyhow::Result`]. Failures the caller
//! should see (quota, validation, tokens, permissions) are raised as a
//! [`DeskError`] inside the `anyhow::Error`, so the HTTP layer can recover
//! the kind with [`DeskError::find`] and pick a status code. Anything that is
//! not a `DeskError` is an internal failure.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeskError {
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    TokenInvalid(String),
    #[error("{0}")]
    TokenExpired(String),
    #[error("{0}")]
    TokenUsed(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Unauthenticated(String),
}

impl DeskError {
    /// Machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DeskError::QuotaExceeded(_) => "quota_exceeded",
            DeskError::Validation(_) => "validation_error",
            DeskError::NotFound(_) => "not_found",
            DeskError::TokenInvalid(_) => "token_invalid",
            DeskError::TokenExpired(_) => "token_expired",
            DeskError::TokenUsed(_) => "token_used",
            DeskError::PermissionDenied(_) => "permission_denied",
            DeskError::Unauthenticated(_) => "unauthenticated",
        }
    }

    /// Look for a `DeskError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&DeskError> {
        err.chain().find_map(|cause| cause.downcast_ref::<DeskError>())
    }
}

pub fn not_found(what: &str, id: &str) -> anyhow::Error {
    DeskError::NotFound(format!("{} not found: {}", what, id)).into()
}

pub fn validation(message: impl Into<String>) -> anyhow::Error {
    DeskError::Validation(message.into()).into()
}

pub fn permission_denied(message: impl Into<String>) -> anyhow::Error {
    DeskError::PermissionDenied(message.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_find_through_context() {
        let err: anyhow::Result<()> = Err(validation("bad payload"));
        let err = err.context("reorder failed").unwrap_err();
        let kind = DeskError::find(&err).unwrap();
        assert_eq!(kind.code(), "validation_error");
        assert_eq!(kind.to_string(), "bad payload");
    }

    #[test]
    fn test_find_returns_none_for_plain_errors() {
        let err = anyhow::anyhow!("disk on fire");
        assert!(DeskError::find(&err).is_none());
    }
}
