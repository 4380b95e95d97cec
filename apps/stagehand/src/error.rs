//! # Application Errors
//!
//! Everything the binary can fail with, and how each failure maps onto an
//! HTTP status.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use stagehand_core::ChainError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// The config file could not be read.
    #[error("cannot read config '{}': {message}", path.display())]
    ConfigRead { path: PathBuf, message: String },

    /// The config file is not valid TOML for [`crate::config::Config`].
    #[error("invalid config '{}': {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    /// A chain rejected the call.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// No open screen has this id.
    #[error("screen {0} not found")]
    ScreenNotFound(u64),

    /// A key in a request does not have the stage's key type.
    #[error("invalid key for stage '{stage}': {message}")]
    InvalidKey { stage: String, message: String },

    /// The stage name is not one of the gradebook stages.
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// The screen has no explicit selection.
    #[error("{0} screens have no selectable stage")]
    NoSelection(&'static str),

    /// Binding or serving failed.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl AppError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ScreenNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidKey { .. } | AppError::UnknownStage(_) => StatusCode::BAD_REQUEST,
            AppError::NoSelection(_) => StatusCode::CONFLICT,
            AppError::Chain(ChainError::Disposed) => StatusCode::GONE,
            AppError::Chain(
                ChainError::NotInCollection(_)
                | ChainError::NotSelectable(_)
                | ChainError::DerivedKey(_),
            ) => StatusCode::CONFLICT,
            AppError::Chain(_)
            | AppError::ConfigRead { .. }
            | AppError::ConfigParse { .. }
            | AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
