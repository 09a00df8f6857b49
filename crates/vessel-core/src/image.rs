use crate::CoreError;
use std::path::{Path, PathBuf};
use vessel_schema::ImageConfig;

/// A local image the launchers can run: a root filesystem plus its OCI image
/// configuration.
pub trait ImageSource {
    fn name(&self) -> &str;

    fn rootfs(&self) -> &Path;

    fn config(&self) -> Result<ImageConfig, CoreError>;
}

/// An unpacked image directory: `<dir>/rootfs/` and an optional
/// `<dir>/config.json` image configuration.
#[derive(Debug, Clone)]
pub struct DirectoryImage {
    dir: PathBuf,
    rootfs: PathBuf,
    name: String,
}

impl DirectoryImage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        let rootfs = dir.join("rootfs");
        if !rootfs.is_dir() {
            return Err(CoreError::Image(format!(
                "{} has no rootfs directory",
                dir.display()
            )));
        }
        let name = dir
            .file_name()
            .map_or_else(|| dir.to_string_lossy(), |n| n.to_string_lossy())
            .into_owned();
        Ok(Self { dir, rootfs, name })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ImageSource for DirectoryImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    fn config(&self) -> Result<ImageConfig, CoreError> {
        let path = self.dir.join("config.json");
        if path.exists() {
            Ok(ImageConfig::load(&path)?)
        } else {
            Ok(ImageConfig::default())
        }
    }
}
