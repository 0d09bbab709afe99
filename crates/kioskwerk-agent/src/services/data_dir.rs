// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::ffi::OsString;
use std::path::PathBuf;

use kioskwerk_core::error::Result;

/// Overrides every other location when set.
pub const DATA_DIR_ENV: &str = "KIOSKWERK_DATA_DIR";

/// Return the agent data directory, creating it if needed.
pub fn data_dir() -> Result<PathBuf> {
    let dir = resolve(
        std::env::var_os(DATA_DIR_ENV),
        std::env::var_os("XDG_DATA_HOME"),
        std::env::var_os("HOME"),
    );
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn resolve(explicit: Option<OsString>, xdg: Option<OsString>, home: Option<OsString>) -> PathBuf {
    let non_empty = |v: Option<OsString>| v.filter(|v| !v.is_empty()).map(PathBuf::from);

    if let Some(dir) = non_empty(explicit) {
        return dir;
    }
    let base = non_empty(xdg)
        .or_else(|| non_empty(home).map(|h| h.join(".local").join("share")))
        // Last resort
        .unwrap_or_else(|| PathBuf::from("/var/lib"));
    base.join("kioskwerk")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(s: &str) -> Option<OsString> {
        Some(OsString::from(s))
    }

    #[test]
    fn explicit_override_wins() {
        assert_eq!(
            resolve(os("/srv/kiosk"), os("/xdg"), os("/home/k")),
            PathBuf::from("/srv/kiosk")
        );
    }

    #[test]
    fn xdg_then_home() {
        assert_eq!(
            resolve(None, os("/xdg"), os("/home/k")),
            PathBuf::from("/xdg/kioskwerk")
        );
        assert_eq!(
            resolve(os(""), None, os("/home/k")),
            PathBuf::from("/home/k/.local/share/kioskwerk")
        );
    }

    #[test]
    fn nothing_set() {
        assert_eq!(resolve(None, None, None), PathBuf::from("/var/lib/kioskwerk"));
    }
}
