//! Workspace artifacts and their lifecycle.
//!
//! A workspace is one root directory holding four build artifacts:
//!
//! ```text
//! <root>/
//! ├── rootfs/          root filesystem staging tree
//! ├── staging/         scratch space (kernel payload, build state)
//! ├── iso/             ISO layout (boot/grub/grub.cfg, kernel, initramfs)
//! └── <Image>.iso      final image
//! ```
//!
//! Stages receive a [`Workspace`] handle instead of reaching for global paths.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::WorkspaceError;

pub const ROOTFS_DIR: &str = "rootfs";
pub const STAGING_DIR: &str = "staging";
pub const ISO_DIR: &str = "iso";
pub const LOCK_FILENAME: &str = ".doomlinux.lock";

/// One of the four workspace artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Rootfs,
    Staging,
    Iso,
    Image,
}

impl Artifact {
    pub const ALL: [Artifact; 4] = [
        Artifact::Rootfs,
        Artifact::Staging,
        Artifact::Iso,
        Artifact::Image,
    ];
}

/// Handle over the artifact paths of one workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    image_filename: String,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, image_filename: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            image_filename: image_filename.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join(ROOTFS_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn iso_dir(&self) -> PathBuf {
        self.root.join(ISO_DIR)
    }

    pub fn image_path(&self) -> PathBuf {
        self.root.join(&self.image_filename)
    }

    /// Temporary image path; renamed onto [`Self::image_path`] on success.
    pub fn partial_image_path(&self) -> PathBuf {
        self.root.join(format!("{}.partial", self.image_filename))
    }

    pub fn grub_cfg_path(&self) -> PathBuf {
        self.iso_dir().join("boot/grub/grub.cfg")
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        match artifact {
            Artifact::Rootfs => self.rootfs_dir(),
            Artifact::Staging => self.staging_dir(),
            Artifact::Iso => self.iso_dir(),
            Artifact::Image => self.image_path(),
        }
    }

    /// Whether the artifact is present. Never touches the filesystem beyond a stat.
    pub fn exists(&self, artifact: Artifact) -> bool {
        let path = self.path(artifact);
        match artifact {
            Artifact::Image => path.is_file(),
            _ => path.is_dir(),
        }
    }

    /// True when none of the four artifacts exist.
    pub fn is_clean(&self) -> bool {
        Artifact::ALL.iter().all(|a| !self.exists(*a)) && !self.partial_image_path().exists()
    }

    /// Remove every artifact that is present.
    ///
    /// Idempotent: already-absent artifacts are skipped, so a reset that
    /// failed partway can simply be called again.
    pub fn reset(&self) -> Result<(), WorkspaceError> {
        remove_path(&self.partial_image_path())?;
        for artifact in Artifact::ALL {
            remove_path(&self.path(artifact))?;
        }
        info!(root = %self.root.display(), "workspace reset");
        Ok(())
    }

    /// Take the advisory build lock for this root.
    ///
    /// Fails immediately if another process holds it.
    pub fn lock(&self) -> Result<WorkspaceLock, WorkspaceError> {
        let path = self.root.join(LOCK_FILENAME);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| WorkspaceError::LockOpen {
                path: path.clone(),
                source,
            })?;
        }

        // Never unlink a lock file we do not hold; a second process could
        // then lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| WorkspaceError::LockOpen {
                path: path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(WorkspaceError::Locked {
                root: self.root.clone(),
                path,
            });
        }

        debug!(lock = %path.display(), "workspace lock acquired");
        Ok(WorkspaceLock { _file: file, path })
    }
}

fn remove_path(path: &Path) -> Result<(), WorkspaceError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(WorkspaceError::Remove {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => {
            debug!(path = %path.display(), "removed workspace artifact");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkspaceError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populated() -> (TempDir, Workspace) {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), "DoomLinux.iso");
        fs::create_dir_all(ws.rootfs_dir().join("root")).unwrap();
        fs::write(ws.rootfs_dir().join("root/file"), "x").unwrap();
        fs::create_dir_all(ws.staging_dir()).unwrap();
        fs::create_dir_all(ws.iso_dir().join("boot/grub")).unwrap();
        fs::write(ws.image_path(), "iso").unwrap();
        (temp, ws)
    }

    #[test]
    fn reset_removes_all_artifacts() {
        let (_temp, ws) = populated();
        for artifact in Artifact::ALL {
            assert!(ws.exists(artifact), "{artifact:?} should exist");
        }

        ws.reset().unwrap();

        for artifact in Artifact::ALL {
            assert!(!ws.exists(artifact), "{artifact:?} should be gone");
        }
        assert!(ws.is_clean());
    }

    #[test]
    fn reset_twice_is_a_no_op() {
        let (_temp, ws) = populated();
        ws.reset().unwrap();
        ws.reset().unwrap();
        assert!(ws.is_clean());
    }

    #[test]
    fn reset_on_missing_root_is_ok() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path().join("never-created"), "DoomLinux.iso");
        ws.reset().unwrap();
    }

    #[test]
    fn reset_after_partial_cleanup_completes() {
        let (_temp, ws) = populated();
        fs::remove_dir_all(ws.rootfs_dir()).unwrap();
        fs::remove_file(ws.image_path()).unwrap();

        ws.reset().unwrap();
        assert!(ws.is_clean());
    }

    #[test]
    fn reset_removes_leftover_partial_image() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), "DoomLinux.iso");
        fs::write(ws.partial_image_path(), "trunc").unwrap();
        assert!(!ws.is_clean());

        ws.reset().unwrap();
        assert!(ws.is_clean());
    }

    #[test]
    fn exists_distinguishes_files_and_dirs() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), "DoomLinux.iso");
        // A directory where the image should be is not an image.
        fs::create_dir_all(ws.image_path()).unwrap();
        assert!(!ws.exists(Artifact::Image));
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), "DoomLinux.iso");

        let guard = ws.lock().unwrap();
        assert!(guard.path().exists());
        assert!(matches!(ws.lock(), Err(WorkspaceError::Locked { .. })));

        drop(guard);
        assert!(!temp.path().join(LOCK_FILENAME).exists());
        let _again = ws.lock().unwrap();
    }
}
