//! Writes the process ID to a file at startup.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Ported from `original_source/pkg/utils/file.go`'s `CreatePIDFile`:
//! an empty path is a no-op, parent directories are created as needed.

use std::path::Path;

/// Writes the current process ID to `path`. Does nothing if `path` is
/// empty. Creates `path`'s parent directories if they don't exist.
pub fn write(path: &Path) -> std::io::Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, std::process::id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn empty_path_is_a_no_op() {
        write(Path::new("")).unwrap();
    }

    #[test]
    fn writes_current_pid_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("udp-fanout.pid");
        write(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("nested").join("deeper").join("udp-fanout.pid");
        write(&path).unwrap();
        assert!(path.exists());
    }
}
