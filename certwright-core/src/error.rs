//! Error taxonomy for the certificate lifecycle coordinator.

use std::collections::HashMap;
use thiserror::Error;

// MARK: - Result

/// Result type used throughout `certwright-core`.
pub type Result<T> = std::result::Result<T, CertsError>;

// MARK: - Error codes

/// Machine-readable error code, matching the taxonomy in the component spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidDomain,
    CaaMismatch,
    NotFound,
    InputValidation,
    ChallengeNotFound,
    ChallengeFail,
    AccountUnavailable,
    Transport,
    Internal,
}

impl ErrorCode {
    /// The suggested HTTP-style response code for this error.
    pub fn response_code(self) -> u16 {
        match self {
            ErrorCode::InvalidDomain => 400,
            ErrorCode::CaaMismatch => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::InputValidation => 400,
            ErrorCode::ChallengeNotFound => 404,
            ErrorCode::ChallengeFail => 500,
            ErrorCode::AccountUnavailable => 500,
            ErrorCode::Transport => 502,
            ErrorCode::Internal => 500,
        }
    }

    /// The wire-level machine code string.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidDomain => "invalid_domain",
            ErrorCode::CaaMismatch => "caa_mismatch",
            ErrorCode::NotFound => "not_found",
            ErrorCode::InputValidation => "InputValidationError",
            ErrorCode::ChallengeNotFound => "ChallengeNotFound",
            ErrorCode::ChallengeFail => "ChallengeFail",
            ErrorCode::AccountUnavailable => "account_unavailable",
            ErrorCode::Transport => "transport_error",
            ErrorCode::Internal => "internal_error",
        }
    }
}

/// The aggregate error type surfaced by every public operation.
///
/// Carries its [`ErrorCode`] through `?`/`From` conversions so nothing
/// downstream needs to reconstruct it (see DESIGN.md open question #2).
#[derive(Debug, Error)]
pub enum CertsError {
    #[error("🚫 \"{domain}\" is not a syntactically valid domain")]
    InvalidDomain { domain: String },

    #[error("⛔ CAA policy forbids issuance for \"{domain}\": allowed issuers are {allowed:?}, found {found:?}")]
    CaaMismatch {
        domain: String,
        allowed: Vec<String>,
        found: Vec<String>,
    },

    #[error("🔍 Not Found: no record for \"{0}\"")]
    NotFound(String),

    #[error("⚠️ Input Validation Error: {details:?}")]
    InputValidation { details: HashMap<String, String> },

    #[error("🧩 no challenge found for ({host}, {token})")]
    ChallengeNotFound { host: String, token: String },

    #[error("🧩 Challenge Error: {0}")]
    ChallengeFail(String),

    #[error("👤 Account Management Error: {0}")]
    AccountUnavailable(String),

    #[error("💥 Transport Error: {0}")]
    Transport(String),

    #[error("🔴 Protocol Error: {0}")]
    Acme(String),

    #[error("💣 Internal Error: {0}")]
    Internal(String),
}

// MARK: - Conversions

impl CertsError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CertsError::InvalidDomain { .. } => ErrorCode::InvalidDomain,
            CertsError::CaaMismatch { .. } => ErrorCode::CaaMismatch,
            CertsError::NotFound(_) => ErrorCode::NotFound,
            CertsError::InputValidation { .. } => ErrorCode::InputValidation,
            CertsError::ChallengeNotFound { .. } => ErrorCode::ChallengeNotFound,
            CertsError::ChallengeFail(_) => ErrorCode::ChallengeFail,
            CertsError::AccountUnavailable(_) => ErrorCode::AccountUnavailable,
            CertsError::Transport(_) => ErrorCode::Transport,
            CertsError::Acme(_) => ErrorCode::Transport,
            CertsError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn response_code(&self) -> u16 {
        self.code().response_code()
    }
}

impl From<redis::RedisError> for CertsError {
    fn from(e: redis::RedisError) -> Self {
        CertsError::Transport(e.to_string())
    }
}

impl From<instant_acme::Error> for CertsError {
    fn from(e: instant_acme::Error) -> Self {
        CertsError::Acme(e.to_string())
    }
}
