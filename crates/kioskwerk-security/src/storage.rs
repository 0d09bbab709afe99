// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session workspaces on disk.
//
// Layout:
//   <root>/<session_id>/files/<file_id>   -- validated customer bytes
//   <root>/<session_id>/metadata.json     -- WorkspaceMetadata
//
// Original file names never appear in a path. Destruction of a workspace is a
// contract, not a call: every regular file is shredded, the tree is removed,
// and `verify` proves it by the absence of the directory. Destroy is
// idempotent and serialised per session id.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::{DeclaredFile, FileId, FileRecord, SessionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::integrity::{hash_bytes, verify_hash};
use crate::shred::Shredder;
use crate::validation::{self, IntakeLimits};

const FILES_DIR: &str = "files";
const METADATA_FILE: &str = "metadata.json";
const METADATA_TMP: &str = "metadata.json.tmp";

/// Directory depth searched for stray artifacts.
const STRAY_SCAN_DEPTH: usize = 4;

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileRecord>,
}

/// A directory found under the session root.
#[derive(Debug, Clone)]
pub struct OrphanWorkspace {
    /// Directory name as found on disk (lossy for non-UTF-8 names).
    pub name: String,
    pub path: PathBuf,
    /// Present when the name is a well-formed session id.
    pub session_id: Option<SessionId>,
}

/// Owner of the on-disk layout for every session.
pub struct SecureStorage {
    root: PathBuf,
    limits: IntakeLimits,
    shredder: Arc<dyn Shredder>,
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SecureStorage {
    /// Open the session root, creating it (mode 0700 on Unix) if needed.
    #[instrument(skip_all, fields(root = %root.as_ref().display(), shredder = shredder.name()))]
    pub fn new(
        root: impl AsRef<Path>,
        limits: IntakeLimits,
        shredder: Arc<dyn Shredder>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        create_private_dir(&root)
            .map_err(|e| KioskError::Filesystem(format!("session root {}: {e}", root.display())))?;
        info!("secure storage ready");
        Ok(Self {
            root,
            limits,
            shredder,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &IntakeLimits {
        &self.limits
    }

    pub fn shredder_name(&self) -> &'static str {
        self.shredder.name()
    }

    pub fn workspace_path(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    // -- Workspace creation ---------------------------------------------------

    /// Materialise `<root>/<id>/files/` and an empty metadata record.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn create_workspace(&self, session_id: &SessionId) -> Result<PathBuf> {
        let dir = self.workspace_path(session_id);
        let build = || -> std::io::Result<()> {
            create_private_dir(&dir)?;
            create_private_dir(&dir.join(FILES_DIR))?;
            let metadata = WorkspaceMetadata {
                session_id: session_id.clone(),
                created_at: Utc::now(),
                files: Vec::new(),
            };
            write_metadata(&dir, &metadata)
        };

        if let Err(e) = build() {
            // Leave nothing half-built behind.
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %cleanup, "could not remove partial workspace");
                }
            }
            return Err(KioskError::Filesystem(format!(
                "create workspace for {session_id}: {e}"
            )));
        }

        debug!("workspace created");
        Ok(dir)
    }

    /// Read the session's metadata record.
    pub fn read_metadata(&self, session_id: &SessionId) -> Result<WorkspaceMetadata> {
        let path = self.workspace_path(session_id).join(METADATA_FILE);
        let data = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KioskError::SessionNotFound(session_id.to_string()),
            _ => KioskError::Io(e),
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    // -- Intake ---------------------------------------------------------------

    /// Validate and persist an uploaded file.
    pub fn receive(
        &self,
        session_id: &SessionId,
        bytes: &[u8],
        declared: &DeclaredFile,
    ) -> Result<FileRecord> {
        self.receive_guarded(session_id, bytes, declared, &|| true)
    }

    /// Like [`receive`](Self::receive), but `still_active` is consulted before
    /// the write and again before the metadata commit. If it turns false the
    /// partial file is destroyed and `SessionNotActive` is returned.
    #[instrument(skip_all, fields(session_id = %session_id, size = bytes.len()))]
    pub fn receive_guarded(
        &self,
        session_id: &SessionId,
        bytes: &[u8],
        declared: &DeclaredFile,
        still_active: &dyn Fn() -> bool,
    ) -> Result<FileRecord> {
        let document_type = validation::validate_upload(bytes, declared, &self.limits)?;
        let page_count = validation::page_count(bytes, document_type)?;

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let dir = self.workspace_path(session_id);
        if !dir.join(FILES_DIR).is_dir() {
            return Err(KioskError::SessionNotActive(session_id.to_string()));
        }
        let mut metadata = self.read_metadata(session_id)?;

        if metadata.files.len() >= self.limits.max_files_per_session {
            return Err(KioskError::SessionLimit(format!(
                "at most {} files per session",
                self.limits.max_files_per_session
            )));
        }
        let total: u64 = metadata.files.iter().map(|f| f.size_bytes).sum();
        if total + bytes.len() as u64 > self.limits.max_session_bytes {
            return Err(KioskError::SessionLimit(format!(
                "at most {} bytes per session",
                self.limits.max_session_bytes
            )));
        }

        if !still_active() {
            return Err(KioskError::SessionNotActive(session_id.to_string()));
        }

        let file_id = FileId::new();
        let path = dir.join(FILES_DIR).join(file_id.to_string());
        let sha256 = hash_bytes(bytes);

        if let Err(e) = write_new_file(&path, bytes).and_then(|()| {
            let written = fs::read(&path)?;
            verify_hash(&written, &sha256)
        }) {
            self.discard_partial(&path);
            return Err(match e {
                KioskError::Io(io) => KioskError::Filesystem(format!("write file {file_id}: {io}")),
                other => other,
            });
        }

        if !still_active() {
            self.discard_partial(&path);
            return Err(KioskError::SessionNotActive(session_id.to_string()));
        }

        let record = FileRecord {
            id: file_id,
            original_name: declared.name.clone(),
            document_type,
            size_bytes: bytes.len() as u64,
            path: path.clone(),
            page_count,
            sha256,
            received_at: Utc::now(),
        };
        metadata.files.push(record.clone());

        if let Err(e) = write_metadata(&dir, &metadata) {
            self.discard_partial(&path);
            return Err(KioskError::Filesystem(format!("update metadata: {e}")));
        }

        info!(file_id = %file_id, ?document_type, page_count, "file received");
        Ok(record)
    }

    /// Withdraw a committed file: drop it from the metadata and shred it.
    /// A workspace that is already gone is not an error.
    pub fn discard_file(&self, session_id: &SessionId, file_id: &FileId) -> Result<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let dir = self.workspace_path(session_id);
        let mut metadata = match self.read_metadata(session_id) {
            Ok(metadata) => metadata,
            Err(KioskError::SessionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        metadata.files.retain(|f| f.id != *file_id);
        write_metadata(&dir, &metadata)
            .map_err(|e| KioskError::Filesystem(format!("update metadata: {e}")))?;
        self.discard_partial(&dir.join(FILES_DIR).join(file_id.to_string()));
        debug!(file_id = %file_id, "file discarded");
        Ok(())
    }

    fn discard_partial(&self, path: &Path) {
        if fs::symlink_metadata(path).is_err() {
            return;
        }
        if let Err(e) = self.shredder.shred_file(path) {
            warn!(error = %e, "could not shred partial upload, unlinking");
            if let Err(e) = fs::remove_file(path) {
                error!(error = %e, path = %path.display(), "partial upload left on disk");
            }
        }
    }

    // -- Destruction ----------------------------------------------------------

    /// Paths that a destruction of this session targets, relative to the root.
    ///
    /// Must be collected before `destroy`; afterwards there is nothing left to
    /// enumerate.
    pub fn artifact_paths(&self, session_id: &SessionId) -> Vec<String> {
        self.artifacts_under(&self.workspace_path(session_id))
    }

    /// Same as [`artifact_paths`](Self::artifact_paths) for an arbitrary
    /// workspace directory under the root.
    pub fn artifacts_under(&self, dir: &Path) -> Vec<String> {
        let mut found = Vec::new();
        if fs::symlink_metadata(dir).is_err() {
            return found;
        }
        let mut entries = Vec::new();
        collect_tree(dir, &mut entries);
        entries.push(dir.to_path_buf());
        for entry in &entries {
            let rel = entry.strip_prefix(&self.root).unwrap_or(entry);
            found.push(rel.display().to_string());
        }
        found
    }

    /// Shred every file of the session and remove its workspace.
    ///
    /// A workspace that does not exist is already destroyed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn destroy(&self, session_id: &SessionId) -> Result<()> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            self.destroy_tree(&self.workspace_path(session_id))
        };
        drop(lock);
        self.prune_lock(session_id);
        result
    }

    /// Destroy a directory under the root that has no well-formed session id.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn destroy_path(&self, path: &Path) -> Result<()> {
        if path.parent() != Some(self.root.as_path()) {
            return Err(KioskError::Filesystem(format!(
                "refusing to destroy {} outside the session root",
                path.display()
            )));
        }
        self.destroy_tree(path)
    }

    fn destroy_tree(&self, dir: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(dir) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("workspace already gone");
                return Ok(());
            }
            Err(e) => return Err(KioskError::Filesystem(format!("stat workspace: {e}"))),
        };

        if !meta.is_dir() {
            // A stray file or link where a workspace should be.
            return self.destroy_entry(dir, &meta);
        }

        let mut entries = Vec::new();
        collect_tree(dir, &mut entries);

        let mut errors = Vec::new();
        let mut shredded = 0usize;
        for path in &entries {
            match fs::symlink_metadata(path) {
                Ok(m) if m.is_dir() => {}
                Ok(m) => match self.destroy_entry(path, &m) {
                    Ok(()) => shredded += 1,
                    Err(e) => errors.push(e.to_string()),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(format!("stat {}: {e}", path.display())),
            }
        }

        // Unshredded files stay in place so a retry can overwrite them.
        if !errors.is_empty() {
            return Err(KioskError::Filesystem(errors.join("; ")));
        }

        fs::remove_dir_all(dir)
            .or_else(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
            .map_err(|e| KioskError::Filesystem(format!("remove workspace: {e}")))?;

        info!(files = shredded, shredder = self.shredder.name(), "workspace destroyed");
        Ok(())
    }

    fn destroy_entry(&self, path: &Path, meta: &fs::Metadata) -> Result<()> {
        if meta.is_file() && meta.len() > 0 {
            self.shredder.shred_file(path)
        } else {
            // Links, sockets and empty files carry no content to overwrite.
            fs::remove_file(path)
                .map_err(|e| KioskError::Filesystem(format!("unlink {}: {e}", path.display())))
        }
    }

    /// True only if the workspace path is inaccessible.
    pub fn verify(&self, session_id: &SessionId) -> bool {
        self.verify_path(&self.workspace_path(session_id))
    }

    pub fn verify_path(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_err()
    }

    // -- Discovery ------------------------------------------------------------

    /// Every directory directly under the session root.
    pub fn list_workspaces(&self) -> Result<Vec<OrphanWorkspace>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| KioskError::Filesystem(format!("scan session root: {e}")))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KioskError::Filesystem(format!("scan session root: {e}")))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            found.push(OrphanWorkspace {
                session_id: entry.file_name().to_str().and_then(SessionId::parse),
                name,
                path: entry.path(),
            });
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    /// Anything under the root whose name contains `name` (normally a session id).
    pub fn stray_artifacts(&self, name: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        scan_named(&self.root, name, STRAY_SCAN_DEPTH, &mut found);
        found
    }

    // -- Locking --------------------------------------------------------------

    fn session_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(session_id.clone()).or_default())
    }

    fn prune_lock(&self, session_id: &SessionId) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(session_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(session_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_new_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Write metadata via a temp file and rename so readers never see a torn record.
fn write_metadata(dir: &Path, metadata: &WorkspaceMetadata) -> std::io::Result<()> {
    let tmp = dir.join(METADATA_TMP);
    let json = serde_json::to_vec_pretty(metadata)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(METADATA_FILE))
}

/// Collect every entry below `dir`, deepest first. Symlinks are not followed.
fn collect_tree(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            collect_tree(&path, out);
        }
        out.push(path);
    }
}

fn scan_named(dir: &Path, needle: &str, depth: usize, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_name().to_string_lossy().contains(needle) {
            out.push(path.clone());
        }
        if depth > 1 && entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            scan_named(&path, needle, depth - 1, out);
        }
    }
}
