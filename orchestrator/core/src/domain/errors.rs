// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Errors
//!
//! Tagged error type shared by every pop operation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Classifies failures into operator-facing kinds

use crate::domain::store::StoreError;
use thiserror::Error;

/// Coarse classification used by callers that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The namespace is not in the state the operation requires.
    State,
    /// A required node is absent. Also a [`ErrorKind::State`] error.
    NotFound,
    /// A service type could not be resolved.
    Service,
    Usage,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum PopError {
    #[error("{0}")]
    State(String),

    #[error("state not found: {0}")]
    StateNotFound(String),

    #[error("unknown service type: {0}")]
    Service(String),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error at {path}: {message}")]
    Serialization { path: String, message: String },

    #[error("process error: {0}")]
    Process(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PopError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PopError::State(_) => ErrorKind::State,
            PopError::StateNotFound(_) => ErrorKind::NotFound,
            PopError::Service(_) => ErrorKind::Service,
            PopError::Usage(_) | PopError::Config(_) => ErrorKind::Usage,
            PopError::Store(_)
            | PopError::Serialization { .. }
            | PopError::Process(_)
            | PopError::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// True for both [`PopError::State`] and [`PopError::StateNotFound`].
    pub fn is_state_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::State | ErrorKind::NotFound)
    }

    pub fn serialization(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PopError::Serialization {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type PopResult<T> = Result<T, PopError>;
