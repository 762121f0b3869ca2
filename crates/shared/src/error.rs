use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Unavailable,
    InvalidRequest,
    Unauthorized,
}

/// Why a send was refused before anything was appended to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    EmptyBody,
    NoSender,
    NoActiveConversation,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::EmptyBody => "message body is empty",
            Self::NoSender => "no authenticated sender",
            Self::NoActiveConversation => "no active conversation",
        };
        f.write_str(text)
    }
}

/// Structured outcome handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(RejectReason),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl SyncError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
        }
    }

    pub fn report(&self) -> ErrorReport {
        let message = match self {
            Self::NotFound(message) | Self::Unavailable(message) | Self::Unauthorized(message) => {
                message.clone()
            }
            Self::InvalidRequest(reason) => reason.to_string(),
        };
        ErrorReport::new(self.code(), message)
    }
}

impl From<SyncError> for ErrorReport {
    fn from(value: SyncError) -> Self {
        value.report()
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Unavailable(format!("malformed row: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_code_and_reason() {
        let report = SyncError::InvalidRequest(RejectReason::EmptyBody).report();
        assert_eq!(report.code, ErrorCode::InvalidRequest);
        assert_eq!(report.message, "message body is empty");
    }

    #[test]
    fn report_serializes_code_in_snake_case() {
        let report = ErrorReport::from(SyncError::not_found("chat 7"));
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "chat 7");
    }
}
