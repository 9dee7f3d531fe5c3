//! Daemon discovery lockfile
//!
//! In daemon mode the adapter writes `${home}/.claude/ide/${port}.lock` so
//! editors can discover the running instance. The port is encoded in the
//! filename; the body carries the pid, the workspace folders, the ide name
//! and the transport label. The file is removed on clean shutdown.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, warn};

use crate::types::Result;

/// Directory the discovery lockfiles live in
pub fn lock_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("ide"))
}

/// A written lockfile; removed on `remove` or drop
#[derive(Debug)]
pub struct DaemonLockfile {
    path: PathBuf,
}

impl DaemonLockfile {
    /// Write the lockfile for a daemon listening on `port`
    pub fn write(port: u16, workspace_folders: &[PathBuf]) -> Result<Self> {
        let dir = lock_dir().unwrap_or_else(std::env::temp_dir);
        Self::write_in(&dir, port, workspace_folders)
    }

    /// Write the lockfile under an explicit directory (tests)
    pub fn write_in(dir: &Path, port: u16, workspace_folders: &[PathBuf]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{port}.lock"));

        let body = json!({
            "pid": std::process::id(),
            "workspaceFolders": workspace_folders,
            "ideName": "banjo",
            "transport": "ws",
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&body)?)?;
        debug!(path = %path.display(), "Daemon lockfile written");
        Ok(Self { path })
    }

    /// Path of the lockfile
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Remove the lockfile
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lockfile");
            }
        }
    }
}

impl Drop for DaemonLockfile {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lockfile_contents() {
        let dir = tempfile::tempdir().unwrap();
        let folders = vec![PathBuf::from("/tmp/proj")];
        let lock = DaemonLockfile::write_in(dir.path(), 43117, &folders).unwrap();

        assert_eq!(
            lock.path().file_name().unwrap().to_string_lossy(),
            "43117.lock"
        );

        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(lock.path()).unwrap()).unwrap();
        assert_eq!(body["pid"], u64::from(std::process::id()));
        assert_eq!(body["ideName"], "banjo");
        assert_eq!(body["transport"], "ws");
        assert_eq!(body["workspaceFolders"][0], "/tmp/proj");
        // The port lives in the filename only.
        assert!(body.get("port").is_none());
    }

    #[test]
    fn test_lockfile_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let lock = DaemonLockfile::write_in(dir.path(), 1234, &[]).unwrap();
            lock.path().clone()
        };
        assert!(!path.exists());
    }
}
