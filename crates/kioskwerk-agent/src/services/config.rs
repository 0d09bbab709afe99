// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Configuration bootstrap.

use std::path::Path;

use kioskwerk_core::config::CONFIG_FILE;
use kioskwerk_core::{AgentConfig, Result};
use tracing::info;

/// Load `config.json` from `dir`. On first start the defaults are written
/// back so the operator has a file to edit. The result is validated.
pub fn load_or_init(dir: &Path) -> Result<AgentConfig> {
    let path = dir.join(CONFIG_FILE);
    let existed = path.exists();

    let config = AgentConfig::load(dir)?;
    if existed {
        info!(path = %path.display(), "configuration loaded");
    } else {
        config.persist(dir)?;
        info!(path = %path.display(), "default configuration written");
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioskwerk_core::KioskError;

    #[test]
    fn first_start_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_init(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).is_file());
        assert_eq!(config.sessions.timeout_minutes, 30);

        // Second start reads the file it wrote.
        let again = load_or_init(dir.path()).unwrap();
        assert_eq!(again.sessions.timeout_minutes, 30);
    }

    #[test]
    fn operator_edits_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "sessions": { "timeout_minutes": 10 } }"#,
        )
        .unwrap();
        let config = load_or_init(dir.path()).unwrap();
        assert_eq!(config.sessions.timeout_minutes, 10);
        assert_eq!(config.cleanup.max_attempts, 3);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "sessions": { "timeout_minutes": 0 } }"#,
        )
        .unwrap();
        assert!(matches!(
            load_or_init(dir.path()),
            Err(KioskError::Configuration(_))
        ));
    }
}
