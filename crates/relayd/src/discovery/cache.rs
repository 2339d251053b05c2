//! Persistent session cache.
//!
//! Discovery state survives restarts via a small version-tagged JSON
//! document in the config directory. The cache is best-effort: a missing,
//! unreadable, or wrong-version file just means the next full scan starts
//! cold. File mtimes are intentionally not persisted; the first scan
//! after load re-validates every file.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relay_core::SessionMeta;

/// Version tag of the on-disk document.
pub const CACHE_VERSION: u32 = 1;

/// On-disk shape of the session cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFile {
    pub version: u32,
    pub entries: Vec<SessionMeta>,
    pub last_full_scan: DateTime<Utc>,
}

/// Loads cached entries, ignoring anything unusable.
pub fn load(path: &Path) -> Vec<SessionMeta> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No session cache to load");
            return Vec::new();
        }
    };

    let cache: CacheFile = match serde_json::from_str(&contents) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Session cache unreadable; ignoring");
            return Vec::new();
        }
    };

    if cache.version != CACHE_VERSION {
        warn!(
            found = cache.version,
            expected = CACHE_VERSION,
            "Session cache version mismatch; ignoring"
        );
        return Vec::new();
    }

    debug!(entries = cache.entries.len(), "Loaded session cache");
    cache.entries
}

/// Writes the cache atomically with owner-only permissions.
///
/// Performs blocking I/O; call via `spawn_blocking` on hot paths.
pub fn save(path: &Path, entries: Vec<SessionMeta>) -> std::io::Result<()> {
    let cache = CacheFile {
        version: CACHE_VERSION,
        entries,
        last_full_scan: Utc::now(),
    };

    let json = serde_json::to_string_pretty(&cache)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    // Write-then-rename so readers never see a torn document
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{MessageRole, SessionId};
    use tempfile::TempDir;

    fn sample_meta() -> SessionMeta {
        SessionMeta {
            id: SessionId::generate(),
            project_hash: "-home-user-proj".to_string(),
            project_path: "/home/user/proj".to_string(),
            last_message_preview: Some("hello".to_string()),
            last_message_role: MessageRole::User,
            timestamp: Utc::now(),
            cli_version: Some("2.1.0".to_string()),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let meta = sample_meta();

        save(&path, vec![meta.clone()]).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, meta.id);
        assert_eq!(loaded[0].project_path, meta.project_path);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load(&dir.path().join("nope.json")).is_empty());
    }

    #[test]
    fn test_load_ignores_wrong_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{"version":99,"entries":[],"lastFullScan":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn test_load_ignores_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load(&path).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        save(&path, vec![sample_meta()]).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
