// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Intake validation. Everything that is checked before a byte is written.
//
// Order matters: cheap size checks first, then type and name, then the
// declared/actual size comparison, and the magic-byte signature last. Each
// rejection is a distinct `KioskError` variant so the kiosk can tell the
// customer exactly what was wrong.

use kioskwerk_core::config::StorageConfig;
use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::{DeclaredFile, DocumentType};
use lopdf::Document;
use tracing::debug;

/// Longest accepted file name, in bytes.
const MAX_NAME_BYTES: usize = 255;

/// Characters that break paths on at least one platform the front-end runs on.
const PATH_BREAKING: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Per-file and per-session intake limits.
#[derive(Debug, Clone, Copy)]
pub struct IntakeLimits {
    pub max_file_bytes: u64,
    pub max_files_per_session: usize,
    pub max_session_bytes: u64,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for IntakeLimits {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            max_files_per_session: config.max_files_per_session,
            max_session_bytes: config.max_session_bytes,
        }
    }
}

/// Validate an upload against its declared metadata.
///
/// Returns the resolved document type on success.
pub fn validate_upload(
    bytes: &[u8],
    declared: &DeclaredFile,
    limits: &IntakeLimits,
) -> Result<DocumentType> {
    let actual = bytes.len() as u64;

    if actual == 0 || declared.size == 0 {
        return Err(KioskError::EmptyFile);
    }

    let size = actual.max(declared.size);
    if size > limits.max_file_bytes {
        return Err(KioskError::FileTooLarge {
            size,
            limit: limits.max_file_bytes,
        });
    }

    let document_type = DocumentType::from_mime(&declared.mime_type)
        .ok_or_else(|| KioskError::UnsupportedType(declared.mime_type.clone()))?;

    validate_name(&declared.name)?;

    if actual != declared.size {
        return Err(KioskError::SizeMismatch {
            declared: declared.size,
            actual,
        });
    }

    check_signature(bytes, document_type)?;

    debug!(?document_type, size = actual, "upload passed validation");
    Ok(document_type)
}

/// Reject names with control characters or path-breaking characters.
///
/// The error carries a reason only; the name itself never leaves this function.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Err(KioskError::InvalidFileName(reason.to_owned()));

    if name.trim().is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_NAME_BYTES {
        return invalid("name is too long");
    }
    if name.chars().any(char::is_control) {
        return invalid("name contains control characters");
    }
    if name.contains(PATH_BREAKING) {
        return invalid("name contains path separators or reserved characters");
    }
    if name == "." || name.starts_with("..") {
        return invalid("name refers to a directory");
    }
    Ok(())
}

/// Check the leading bytes against the signature for `document_type`.
pub fn check_signature(bytes: &[u8], document_type: DocumentType) -> Result<()> {
    if bytes.starts_with(document_type.signature()) {
        Ok(())
    } else {
        Err(KioskError::SignatureMismatch {
            mime: document_type.mime_type().to_owned(),
        })
    }
}

/// Derive the page count. Authoritative for PDF; everything else counts as
/// a single page until the print sandbox says otherwise.
pub fn page_count(bytes: &[u8], document_type: DocumentType) -> Result<u32> {
    match document_type {
        DocumentType::Pdf => {
            let document = Document::load_mem(bytes)
                .map_err(|e| KioskError::CorruptDocument(format!("unreadable PDF: {e}")))?;
            let pages = document.get_pages().len();
            if pages == 0 {
                return Err(KioskError::CorruptDocument("PDF has no pages".into()));
            }
            Ok(u32::try_from(pages).unwrap_or(u32::MAX))
        }
        DocumentType::Jpeg | DocumentType::Png | DocumentType::Doc | DocumentType::Docx => Ok(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn declared(name: &str, mime: &str, size: usize) -> DeclaredFile {
        DeclaredFile {
            name: name.into(),
            mime_type: mime.into(),
            size: size as u64,
        }
    }

    #[test]
    fn accepts_each_supported_signature() {
        let limits = IntakeLimits::default();
        let cases: [(&str, Vec<u8>); 5] = [
            ("application/pdf", fixtures::pdf_document(1, 0)),
            ("image/jpeg", fixtures::jpeg_bytes()),
            ("image/png", fixtures::png_bytes()),
            ("application/msword", fixtures::doc_bytes()),
            (DocumentType::Docx.mime_type(), fixtures::docx_bytes()),
        ];
        for (mime, bytes) in cases {
            let d = declared("upload", mime, bytes.len());
            assert!(validate_upload(&bytes, &d, &limits).is_ok(), "{mime}");
        }
    }

    #[test]
    fn rejects_empty_file() {
        let err = validate_upload(b"", &declared("a.pdf", "application/pdf", 0), &IntakeLimits::default());
        assert!(matches!(err, Err(KioskError::EmptyFile)));
    }

    #[test]
    fn rejects_oversized_file() {
        let limits = IntakeLimits {
            max_file_bytes: 8,
            ..IntakeLimits::default()
        };
        let bytes = b"%PDF-1.7 and then some";
        let err = validate_upload(bytes, &declared("a.pdf", "application/pdf", bytes.len()), &limits);
        assert!(matches!(err, Err(KioskError::FileTooLarge { limit: 8, .. })));
    }

    #[test]
    fn rejects_size_mismatch() {
        let bytes = fixtures::png_bytes();
        let err = validate_upload(
            &bytes,
            &declared("a.png", "image/png", bytes.len() + 1),
            &IntakeLimits::default(),
        );
        assert!(matches!(err, Err(KioskError::SizeMismatch { .. })));
    }

    #[test]
    fn rejects_signature_mismatch() {
        let bytes = fixtures::png_bytes();
        let err = validate_upload(
            &bytes,
            &declared("a.pdf", "application/pdf", bytes.len()),
            &IntakeLimits::default(),
        );
        assert!(matches!(err, Err(KioskError::SignatureMismatch { .. })));
    }

    #[test]
    fn rejects_unsupported_type() {
        let err = validate_upload(
            b"<html>",
            &declared("a.html", "text/html", 6),
            &IntakeLimits::default(),
        );
        assert!(matches!(err, Err(KioskError::UnsupportedType(_))));
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "   ", "../etc/passwd", "a/b.pdf", "a\\b.pdf", "bad\u{0}name", "x\ny", ".."] {
            assert!(
                matches!(validate_name(name), Err(KioskError::InvalidFileName(_))),
                "{name:?}"
            );
        }
        assert!(validate_name("Résumé (final) v2.pdf").is_ok());
    }

    #[test]
    fn name_error_does_not_echo_name() {
        let err = validate_name("secret\u{7}.pdf").unwrap_err();
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn pdf_page_count_is_authoritative() {
        let bytes = fixtures::pdf_document(3, 0);
        assert_eq!(page_count(&bytes, DocumentType::Pdf).unwrap(), 3);
    }

    #[test]
    fn truncated_pdf_is_corrupt() {
        let err = page_count(b"%PDF-1.7\n%garbage", DocumentType::Pdf);
        assert!(matches!(err, Err(KioskError::CorruptDocument(_))));
    }

    #[test]
    fn images_count_as_one_page() {
        assert_eq!(page_count(&fixtures::png_bytes(), DocumentType::Png).unwrap(), 1);
    }
}
