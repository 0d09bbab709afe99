// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Destructive overwrite of individual files.
//
// Two providers share one contract: when `shred_file` returns `Ok`, the
// file's former content is not recoverable from the bytes at rest and the
// path no longer exists. `probe_shredder` picks one at startup.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use kioskwerk_core::error::{KioskError, Result};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, instrument, warn};

/// Chunk size for overwrite passes.
const CHUNK: usize = 64 * 1024;

/// Capability: destroy one regular file.
pub trait Shredder: Send + Sync {
    /// Short provider name for logs and audit details.
    fn name(&self) -> &'static str;

    /// Overwrite `path` so its content is unrecoverable, then unlink it.
    fn shred_file(&self, path: &Path) -> Result<()>;
}

/// One overwrite pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Zeros,
    Ones,
    Random,
    /// Bitwise complement of whatever the previous pass left on disk.
    Complement,
}

/// Pass order: zero, one, random, complement-of-random, random.
pub const PASSES: [Pass; 5] = [
    Pass::Zeros,
    Pass::Ones,
    Pass::Random,
    Pass::Complement,
    Pass::Random,
];

/// Manual multi-pass overwrite with `sync_all` between passes.
pub struct MultiPassShredder {
    rng: SystemRandom,
}

impl Default for MultiPassShredder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiPassShredder {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Run every pass over `path` without unlinking it.
    pub fn overwrite(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| fs_err("open for overwrite", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| fs_err("stat", path, e))?
            .len();

        for (index, pass) in PASSES.iter().enumerate() {
            self.run_pass(&mut file, len, *pass)
                .map_err(|e| KioskError::Filesystem(format!("pass {index} ({pass:?}): {e}")))?;
            // Each pass must be on stable storage before the next one starts.
            file.sync_all().map_err(|e| fs_err("sync", path, e))?;
        }
        Ok(())
    }

    fn run_pass(&self, file: &mut File, len: u64, pass: Pass) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; CHUNK];
        let mut remaining = len;

        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            let chunk = &mut buf[..n];
            match pass {
                Pass::Zeros => chunk.fill(0x00),
                Pass::Ones => chunk.fill(0xFF),
                Pass::Random => self
                    .rng
                    .fill(chunk)
                    .map_err(|_| std::io::Error::other("system random source unavailable"))?,
                Pass::Complement => {
                    let offset = len - remaining;
                    file.read_exact(chunk)?;
                    chunk.iter_mut().for_each(|b| *b = !*b);
                    file.seek(SeekFrom::Start(offset))?;
                }
            }
            file.write_all(chunk)?;
            remaining -= n as u64;
        }
        file.flush()
    }
}

impl Shredder for MultiPassShredder {
    fn name(&self) -> &'static str {
        "multi-pass"
    }

    #[instrument(skip_all)]
    fn shred_file(&self, path: &Path) -> Result<()> {
        self.overwrite(path)?;
        std::fs::remove_file(path).map_err(|e| fs_err("unlink", path, e))?;
        debug!("file overwritten and unlinked");
        Ok(())
    }
}

/// Delegates to the platform `shred` utility (GNU coreutils).
pub struct SystemShredder {
    program: PathBuf,
}

impl SystemShredder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Shredder for SystemShredder {
    fn name(&self) -> &'static str {
        "system-shred"
    }

    #[instrument(skip_all)]
    fn shred_file(&self, path: &Path) -> Result<()> {
        // Three random passes, a final zero pass, then unlink.
        let output = Command::new(&self.program)
            .arg("--force")
            .arg("--iterations=3")
            .arg("--zero")
            .arg("--remove")
            .arg("--")
            .arg(path)
            .output()
            .map_err(|e| KioskError::Filesystem(format!("spawn {}: {e}", self.program.display())))?;

        if !output.status.success() {
            return Err(KioskError::Filesystem(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if std::fs::symlink_metadata(path).is_ok() {
            return Err(KioskError::Filesystem(
                "shred reported success but the file still exists".into(),
            ));
        }
        Ok(())
    }
}

/// Pick the shredder for this host.
///
/// With `prefer_system` set, a `shred` binary on `PATH` wins; otherwise (or
/// when none is found) the manual multi-pass overwrite is used.
pub fn probe_shredder(prefer_system: bool) -> Arc<dyn Shredder> {
    if prefer_system {
        if let Some(program) = find_system_shred() {
            info!(program = %program.display(), "using system shred utility");
            return Arc::new(SystemShredder::new(program));
        }
        warn!("no system shred utility found, using multi-pass overwrite");
    } else {
        info!("using multi-pass overwrite");
    }
    Arc::new(MultiPassShredder::new())
}

#[cfg(unix)]
fn find_system_shred() -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| ["shred", "gshred"].map(|name| dir.join(name)))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

#[cfg(not(unix))]
fn find_system_shred() -> Option<PathBuf> {
    None
}

fn fs_err(op: &str, path: &Path, e: std::io::Error) -> KioskError {
    KioskError::Filesystem(format!("{op} {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_leaves_no_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        let original: Vec<u8> = b"CONFIDENTIAL ".repeat(10_000);
        std::fs::write(&path, &original).unwrap();

        MultiPassShredder::new().overwrite(&path).unwrap();

        let after = std::fs::read(&path).unwrap();
        assert_eq!(after.len(), original.len(), "length must be preserved");
        assert_ne!(after, original);
        assert!(
            !after.windows(12).any(|w| w == b"CONFIDENTIAL"),
            "plaintext survived the overwrite"
        );
    }

    #[test]
    fn complement_pass_inverts_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        std::fs::write(&path, [0x0Fu8; CHUNK + 17]).unwrap();

        let shredder = MultiPassShredder::new();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        shredder
            .run_pass(&mut file, (CHUNK + 17) as u64, Pass::Complement)
            .unwrap();
        drop(file);

        let after = std::fs::read(&path).unwrap();
        assert!(after.iter().all(|b| *b == 0xF0));
    }

    #[test]
    fn shred_file_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        std::fs::write(&path, b"hello").unwrap();

        MultiPassShredder::new().shred_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn empty_file_is_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        MultiPassShredder::new().shred_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MultiPassShredder::new().shred_file(&dir.path().join("nope"));
        assert!(matches!(result, Err(KioskError::Filesystem(_))));
    }

    #[test]
    fn system_shred_when_available() {
        let Some(program) = find_system_shred() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        std::fs::write(&path, b"secret bytes").unwrap();

        SystemShredder::new(program).shred_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn probe_without_preference_is_multi_pass() {
        assert_eq!(probe_shredder(false).name(), "multi-pass");
    }
}
