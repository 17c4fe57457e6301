// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DebridError>;

#[derive(Debug, Error)]
pub enum DebridError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("no API token configured")]
    MissingToken,

    /// Authentication, quota or account restrictions. An operator has to act.
    #[error("request denied ({code:?}): {message}")]
    Denied { code: Option<i64>, message: String },

    /// The hoster file is gone or cannot be served at all.
    #[error("source unavailable ({code:?}): {message}")]
    Unavailable { code: Option<i64>, message: String },

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("invalid response from resolution service: {0}")]
    InvalidResponse(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
}

impl DebridError {
    /// Whether a later identical request may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_) | Self::RateLimitExceeded | Self::ApiError { .. }
        )
    }
}

// Service error codes, see the public REST documentation.
const DENIED_CODES: &[i64] = &[8, 9, 20, 22, 23, 36];
const UNAVAILABLE_CODES: &[i64] = &[16, 24, 35];
const RATE_LIMIT_CODES: &[i64] = &[34];

/// Map a non-success response to an error, preferring the service's own
/// `error_code` over the HTTP status when both are present.
pub(crate) fn classify(status: u16, code: Option<i64>, message: String) -> DebridError {
    if let Some(code) = code {
        if DENIED_CODES.contains(&code) {
            return DebridError::Denied {
                code: Some(code),
                message,
            };
        }
        if UNAVAILABLE_CODES.contains(&code) {
            return DebridError::Unavailable {
                code: Some(code),
                message,
            };
        }
        if RATE_LIMIT_CODES.contains(&code) {
            return DebridError::RateLimitExceeded;
        }
    }

    match status {
        401 | 403 => DebridError::Denied { code, message },
        404 | 410 => DebridError::Unavailable { code, message },
        429 => DebridError::RateLimitExceeded,
        _ => DebridError::ApiError { status, message },
    }
}
