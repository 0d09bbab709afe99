// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Kioskwerk.

use thiserror::Error;

use crate::types::SessionStatus;

/// Top-level error type for all Kioskwerk operations.
#[derive(Debug, Error)]
pub enum KioskError {
    // -- Intake validation --
    #[error("file is empty")]
    EmptyFile,

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("declared size {declared} does not match received size {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("file content does not match the signature for {mime}")]
    SignatureMismatch { mime: String },

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    /// Carries the reason, never the name itself.
    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("document could not be read: {0}")]
    CorruptDocument(String),

    #[error("session limit reached: {0}")]
    SessionLimit(String),

    // -- Session lifecycle --
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} has expired")]
    SessionExpired(String),

    #[error("session {0} is no longer active")]
    SessionNotActive(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("new sessions are not being admitted: {0}")]
    AdmissionRefused(String),

    // -- Storage / destruction --
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error("database error: {0}")]
    Database(String),

    // -- Environment --
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),

    #[error("feature not available on this platform")]
    PlatformUnavailable,

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KioskError {
    /// True for the errors produced by intake validation. These are answered
    /// to the customer and never escalated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyFile
                | Self::FileTooLarge { .. }
                | Self::SizeMismatch { .. }
                | Self::SignatureMismatch { .. }
                | Self::UnsupportedType(_)
                | Self::InvalidFileName(_)
                | Self::CorruptDocument(_)
                | Self::SessionLimit(_)
        )
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KioskError>;
