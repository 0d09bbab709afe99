// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Kioskwerk session agent.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a customer session.
///
/// Session ids double as directory names under the session root, so they are
/// restricted to a single, path-safe component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept an existing identifier (e.g. a directory name found on disk).
    ///
    /// Returns `None` for anything that is not a single plain path component.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw != "."
            && raw != ".."
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        valid.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a file inside a session workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Accepting uploads and configuration.
    Active,
    /// Handed to the print sandbox.
    Printing,
    /// Printing finished; waiting for the customer to leave or the timer.
    Completed,
    /// Destroyed. Never observable through the registry.
    Terminated,
}

impl SessionStatus {
    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Active, Printing) => true,
            (Printing, Completed) => true,
            // An aborted print job puts the session back in customer hands.
            (Printing, Active) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Terminated
    }
}

/// Payment state as reported by the (external) payment flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// Document formats accepted at the kiosk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    Pdf,
    Jpeg,
    Png,
    /// Legacy Word (OLE compound file).
    Doc,
    /// Office Open XML Word (ZIP container).
    Docx,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        Self::Pdf,
        Self::Jpeg,
        Self::Png,
        Self::Doc,
        Self::Docx,
    ];

    /// MIME type string.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Doc => "application/msword",
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }

    /// Resolve a declared MIME type. Parameters (`; charset=...`) are ignored.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        Self::ALL
            .into_iter()
            .find(|t| t.mime_type().eq_ignore_ascii_case(essence))
            .or_else(|| essence.eq_ignore_ascii_case("image/jpg").then_some(Self::Jpeg))
    }

    /// Leading magic bytes every file of this type must start with.
    pub fn signature(&self) -> &'static [u8] {
        match self {
            Self::Pdf => b"%PDF",
            Self::Jpeg => &[0xFF, 0xD8, 0xFF],
            Self::Png => &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            Self::Doc => &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
            Self::Docx => &[0x50, 0x4B, 0x03, 0x04],
        }
    }
}

/// Metadata declared by the upload front-end alongside the file bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// A validated file stored in a session workspace.
#[derive(Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Customer-supplied name. Never logged or audited.
    pub original_name: String,
    pub document_type: DocumentType,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub page_count: u32,
    /// SHA-256 of the stored bytes.
    pub sha256: String,
    pub received_at: DateTime<Utc>,
}

// Hand-written so that a stray `?record` in a log line cannot leak the name.
impl std::fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRecord")
            .field("id", &self.id)
            .field("original_name", &"<redacted>")
            .field("document_type", &self.document_type)
            .field("size_bytes", &self.size_bytes)
            .field("page_count", &self.page_count)
            .finish()
    }
}

/// A customer session. Values handed out by the registry are copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub shop_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub files: Vec<FileRecord>,
    pub payment_status: PaymentStatus,
}

impl Session {
    pub fn new(shop_id: impl Into<String>, timeout: Duration) -> Self {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30))
            .max(chrono::Duration::milliseconds(1));
        Self {
            id: SessionId::new(),
            shop_id: shop_id.into(),
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now + timeout,
            files: Vec::new(),
            payment_status: PaymentStatus::Pending,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Outcome of one cleanup invocation.
#[derive(Debug, Clone)]
pub struct CleanupResult {
    /// Directory name under the session root that was targeted.
    pub workspace: String,
    /// Absent for orphaned directories whose name is not a session id.
    pub session_id: Option<SessionId>,
    pub success: bool,
    /// Paths (relative to the session root) targeted for destruction.
    pub destroyed_paths: Vec<String>,
    pub errors: Vec<String>,
    pub verification_passed: bool,
    pub elapsed: Duration,
    pub attempts: u32,
    pub note: Option<String>,
}

/// Fault category used for escalation routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Network,
    Printer,
    Resource,
    Session,
    Filesystem,
    Configuration,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Printer => "printer",
            Self::Resource => "resource",
            Self::Session => "session",
            Self::Filesystem => "filesystem",
            Self::Configuration => "configuration",
            Self::System => "system",
        }
    }
}

/// Fault severity. Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A fault reported to the escalation authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemError {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub session_id: Option<SessionId>,
    pub retryable: bool,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
}

impl SystemError {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            severity,
            message: message.into(),
            session_id,
            // Critical faults fail closed instead of retrying.
            retryable: severity != ErrorSeverity::Critical,
            resolved: false,
            timestamp: Utc::now(),
        }
    }
}

/// One sample of host resources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub cpu_percent: f64,
    pub disk_free_bytes: u64,
    pub load_average: f64,
    pub timestamp: DateTime<Utc>,
}

/// Standard paper sizes offered at the kiosk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperSize {
    A4,
    A3,
    Letter,
    Legal,
}

/// Duplex printing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexMode {
    Simplex,
    LongEdge,
    ShortEdge,
}

/// Print options chosen by the customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintOptions {
    pub copies: u32,
    pub paper_size: PaperSize,
    pub duplex: DuplexMode,
    pub color: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            copies: 1,
            paper_size: PaperSize::A4,
            duplex: DuplexMode::Simplex,
            color: false,
        }
    }
}

/// A file as seen by the print sandbox.
#[derive(Debug, Clone)]
pub struct PrintableFile {
    pub file_id: FileId,
    pub path: PathBuf,
    pub document_type: DocumentType,
    pub page_count: u32,
}

/// Read-only view handed to the print sandbox. Paths stop resolving once the
/// session is destroyed.
#[derive(Debug, Clone)]
pub struct PrintSnapshot {
    pub session_id: SessionId,
    pub files: Vec<PrintableFile>,
    pub options: PrintOptions,
}
