// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the core domain layer

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the durable stores and engines
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tab not found: {0}")]
    TabNotFound(String),

    #[error("tab name '{0}' is already taken")]
    DuplicateTabName(String),

    #[error("invalid tab name: {0}")]
    InvalidTabName(String),

    #[error("no edit session is open")]
    NoEditSession,

    #[error("an edit session is already open for {0}")]
    EditSessionOpen(String),

    #[error("path escapes the working directory: {0}")]
    PathOutsideRoot(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("invalid regex '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
