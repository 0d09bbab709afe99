// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Customer-facing error messages for the kiosk screen.
//
// Every technical error is mapped to plain English with a clear suggestion.
// Messages never echo file names or contents back; the person standing at the
// kiosk may not be the one who uploaded the file.

use crate::error::KioskError;

/// How the kiosk screen should present the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Temporary: the kiosk will retry or the customer can simply try again.
    Transient,
    /// The customer must do something (pick another file, start over).
    ActionRequired,
    /// The kiosk cannot serve anyone right now; staff are needed.
    OutOfService,
}

/// A human-readable error with plain English message and actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// Plain English summary (shown as a heading).
    pub message: String,
    /// What the customer should try (shown as body text).
    pub suggestion: String,
    /// Whether trying the same thing again can succeed.
    pub retriable: bool,
    pub severity: Severity,
}

fn human(message: &str, suggestion: &str, retriable: bool, severity: Severity) -> HumanError {
    HumanError {
        message: message.into(),
        suggestion: suggestion.into(),
        retriable,
        severity,
    }
}

/// Convert a `KioskError` into a `HumanError` for the kiosk screen.
pub fn humanize_error(err: &KioskError) -> HumanError {
    use Severity::*;

    match err {
        // -- Intake validation --
        KioskError::EmptyFile => human(
            "This file is empty.",
            "Check that you picked the right file and upload it again.",
            false,
            ActionRequired,
        ),
        KioskError::FileTooLarge { limit, .. } => HumanError {
            message: "This file is too big to print here.".into(),
            suggestion: format!(
                "Files can be up to {} MB. Try reducing the file size or splitting it.",
                limit / (1024 * 1024)
            ),
            retriable: false,
            severity: ActionRequired,
        },
        KioskError::SizeMismatch { .. } => human(
            "The upload didn't arrive complete.",
            "Please upload the file again.",
            true,
            Transient,
        ),
        KioskError::SignatureMismatch { .. } | KioskError::CorruptDocument(_) => human(
            "We couldn't read this file.",
            "The file may be damaged or saved in a different format than its name suggests. Try saving it as a PDF first.",
            false,
            ActionRequired,
        ),
        KioskError::UnsupportedType(_) => human(
            "This type of file can't be printed here.",
            "We accept PDF, JPEG, PNG and Word documents.",
            false,
            ActionRequired,
        ),
        KioskError::InvalidFileName(_) => human(
            "This file name can't be used.",
            "Rename the file using letters and numbers only, then upload it again.",
            false,
            ActionRequired,
        ),
        KioskError::SessionLimit(_) => human(
            "You've reached the upload limit for this visit.",
            "Print what you have, then start a new session for the rest.",
            false,
            ActionRequired,
        ),

        // -- Session lifecycle --
        KioskError::SessionNotFound(_)
        | KioskError::SessionExpired(_)
        | KioskError::SessionNotActive(_) => human(
            "Your session has ended.",
            "For your privacy, your files have been deleted. Scan the code on the screen to start again.",
            false,
            ActionRequired,
        ),
        KioskError::InvalidTransition { .. } => human(
            "That can't be done right now.",
            "Wait for the current step to finish, then try again.",
            true,
            Transient,
        ),
        KioskError::AdmissionRefused(_) => human(
            "This kiosk is busy right now.",
            "Please try again in a few minutes.",
            true,
            Transient,
        ),

        // -- Everything else is the kiosk's problem, not the customer's --
        KioskError::Notification(_) => human(
            "The screen may not update right away.",
            "Your job is still safe. Refresh the page if nothing changes.",
            true,
            Transient,
        ),
        KioskError::Workspace(_)
        | KioskError::Filesystem(_)
        | KioskError::IntegrityMismatch { .. }
        | KioskError::Cleanup(_)
        | KioskError::Database(_)
        | KioskError::Configuration(_)
        | KioskError::PlatformUnavailable
        | KioskError::Io(_)
        | KioskError::Serialization(_) => human(
            "This kiosk is temporarily out of service.",
            "Please ask a member of staff for help.",
            false,
            OutOfService,
        ),
    }
}
