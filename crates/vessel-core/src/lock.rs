use crate::{fs_err, CoreError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Marker whose presence means a bundle belongs to a live container.
pub const BUNDLE_MARKER: &str = ".vessel-oci.lock";

/// Exclusive advisory lock on a container's state directory, released on drop.
pub struct StateLock {
    lock_file: File,
}

impl StateLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(fs_err("create", parent))?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(fs_err("open", lock_path))
    }

    /// Block until the lock is available.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        file.lock_exclusive().map_err(fs_err("lock", lock_path))?;
        Ok(Self { lock_file: file })
    }

    /// Fail with [`CoreError::Locked`] if another holder exists.
    pub fn try_acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { lock_file: file }),
            Err(_) => Err(CoreError::Locked(lock_path.to_path_buf())),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Claim `bundle` by atomically creating its marker file.
pub fn lock_bundle(bundle: &Path) -> Result<(), CoreError> {
    let marker = bundle.join(BUNDLE_MARKER);
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(CoreError::Locked(bundle.to_path_buf()));
        }
        Err(e) => return Err(fs_err("create", marker)(e)),
    };
    writeln!(file, "{}", std::process::id()).map_err(fs_err("write", &marker))?;
    Ok(())
}

/// Drop the claim on `bundle`. A missing marker is not an error.
pub fn release_bundle(bundle: &Path) -> Result<(), CoreError> {
    let marker = bundle.join(BUNDLE_MARKER);
    match std::fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("bundle marker {} already gone", marker.display());
            Ok(())
        }
        Err(e) => Err(fs_err("remove", marker)(e)),
    }
}
