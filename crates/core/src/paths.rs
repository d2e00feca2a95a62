//! Session log root resolution and project directory enumeration.
//!
//! Session logs live in a two-level hierarchy:
//! ```text
//! <root>/
//! ├── {project}/
//! │   ├── {sessionId}.jsonl        ← session log (scanned)
//! │   └── {sessionId}/             ← per-session artifacts (ignored)
//! ```
//! Only files directly inside a project directory are treated as session
//! logs; anything deeper belongs to tool output and is skipped.

use std::path::{Path, PathBuf};

use crate::error::DiscoveryError;

/// Default session log root: `~/.claude/projects`.
pub fn default_root() -> Result<PathBuf, DiscoveryError> {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("projects"))
        .ok_or(DiscoveryError::HomeDirNotFound)
}

/// Whether a path looks like a session log file (depth-2 `.jsonl` or `.log`).
pub fn is_session_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jsonl") | Some("log")
    )
}

/// The session id encoded in a log file path (file stem).
pub fn session_id_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The encoded project directory name a log file belongs to.
pub fn project_dir_from_path(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decode a project directory name into a display name.
///
/// Project directories are percent-encoded-ish transforms of the working
/// directory (`/` becomes `-`), so the best human-readable name is the last
/// path component after URL-decoding.
pub fn project_display_name(encoded: &str) -> String {
    let decoded = urlencoding::decode(encoded)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| encoded.to_string());
    decoded
        .rsplit(['-', '/'])
        .find(|part| !part.is_empty())
        .unwrap_or(&decoded)
        .to_string()
}

/// Enumerate all session log files directly under each project directory.
///
/// A project directory that cannot be read is skipped; enumeration failure
/// is contained to that directory. Returns an error only if the root itself
/// cannot be read.
pub fn scan_session_files(root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let mut files = Vec::new();

    let read_dir = std::fs::read_dir(root).map_err(|e| DiscoveryError::io(root, e))?;

    for project_entry in read_dir.flatten() {
        let project_path = project_entry.path();
        if !project_path.is_dir() {
            continue;
        }

        let sub_read = match std::fs::read_dir(&project_path) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::debug!(path = %project_path.display(), error = %e, "skipping unreadable project dir");
                continue;
            }
        };

        for file_entry in sub_read.flatten() {
            let file_path = file_entry.path();
            if file_path.is_file() && is_session_file(&file_path) {
                files.push(file_path);
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_is_session_file() {
        assert!(is_session_file(Path::new("/root/proj/abc.jsonl")));
        assert!(is_session_file(Path::new("/root/proj/abc.log")));
        assert!(!is_session_file(Path::new("/root/proj/abc.txt")));
        assert!(!is_session_file(Path::new("/root/proj/README.md")));
    }

    #[test]
    fn test_session_id_from_path() {
        assert_eq!(
            session_id_from_path(Path::new("/root/proj/abc-123.jsonl")),
            "abc-123"
        );
    }

    #[test]
    fn test_project_dir_from_path() {
        assert_eq!(
            project_dir_from_path(Path::new("/root/my-proj/abc.jsonl")),
            "my-proj"
        );
    }

    #[test]
    fn test_project_display_name_takes_last_component() {
        assert_eq!(project_display_name("-Users-dev-widgets"), "widgets");
        assert_eq!(project_display_name("plain"), "plain");
    }

    #[test]
    fn test_scan_skips_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj-a");
        fs::create_dir(&proj).unwrap();
        fs::write(proj.join("s1.jsonl"), "{}\n").unwrap();
        fs::write(proj.join("notes.txt"), "x").unwrap();

        // Nested artifact dir must be ignored.
        let nested = proj.join("s1").join("tool-results");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("t1.jsonl"), "{}\n").unwrap();

        let files = scan_session_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("proj-a/s1.jsonl"));
    }

    #[test]
    fn test_scan_missing_root_errors() {
        let result = scan_session_files(Path::new("/nonexistent/agentdeck-root"));
        assert!(matches!(result, Err(DiscoveryError::RootNotFound { .. })));
    }
}
