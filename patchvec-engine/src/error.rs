//! The single structured error surfaced by the service facade.
//!
//! Every internal failure is folded into an [`EngineError`] carrying one of
//! the stable [`ErrorCode`]s; transports render the envelope and map the
//! code to an HTTP status without inspecting messages.

use std::fmt;

use patchvec_embedder::EmbedderError;
use patchvec_model::filter::FilterError;
use patchvec_model::ModelError;
use patchvec_preprocess::PreprocessError;
use patchvec_store::StoreError;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidRequest,
    InvalidFilter,
    UnsupportedMedia,
    TooLarge,
    Unauthorized,
    Forbidden,
    Overloaded,
    Timeout,
    ModelMismatch,
    LegacyMetadata,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidFilter => "invalid_filter",
            ErrorCode::UnsupportedMedia => "unsupported_media",
            ErrorCode::TooLarge => "too_large",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ModelMismatch => "model_mismatch",
            ErrorCode::LegacyMetadata => "legacy_metadata",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists => 409,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::InvalidFilter => 400,
            ErrorCode::UnsupportedMedia => 415,
            ErrorCode::TooLarge => 413,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::Overloaded => 503,
            ErrorCode::Timeout => 504,
            ErrorCode::ModelMismatch => 409,
            ErrorCode::LegacyMetadata => 409,
            ErrorCode::Unavailable => 503,
            ErrorCode::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Overloaded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Wire envelope: `{ok: false, code, error, details?}`.
    pub fn to_envelope(&self) -> Value {
        let mut env = json!({
            "ok": false,
            "code": self.code.as_str(),
            "error": self.message,
        });
        if let Some(d) = &self.details {
            env["details"] = d.clone();
        }
        env
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::InvalidFilter(_) => ErrorCode::InvalidFilter,
            StoreError::ModelMismatch { .. } => ErrorCode::ModelMismatch,
            StoreError::LegacyMetadata(_) => ErrorCode::LegacyMetadata,
            StoreError::Backend(_) | StoreError::Io(_) => ErrorCode::Internal,
        };
        EngineError::new(code, e.to_string())
    }
}

impl From<PreprocessError> for EngineError {
    fn from(e: PreprocessError) -> Self {
        let code = match &e {
            PreprocessError::UnsupportedMedia(_) => ErrorCode::UnsupportedMedia,
            PreprocessError::Parse { .. } | PreprocessError::InvalidOptions(_) => {
                ErrorCode::InvalidRequest
            }
        };
        EngineError::new(code, e.to_string())
    }
}

impl From<EmbedderError> for EngineError {
    fn from(e: EmbedderError) -> Self {
        EngineError::internal(e.to_string())
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::invalid_request(e.to_string())
    }
}

impl From<FilterError> for EngineError {
    fn from(e: FilterError) -> Self {
        EngineError::new(ErrorCode::InvalidFilter, e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
