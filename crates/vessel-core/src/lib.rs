//! Container lifecycle orchestration for Vessel.
//!
//! This crate owns the on-disk state protocol used to drive an external OCI
//! runtime (`driver`, `lock`, `lifecycle`), assembles complete bundle specs
//! from a validated launch configuration (`bundle`), and exposes the `oci` and
//! `native` launchers behind one `Launcher` trait (`launcher`, `image`).

pub mod bundle;
pub mod driver;
pub mod image;
pub mod launcher;
pub mod lifecycle;
pub mod lock;

pub use bundle::BundleAssembler;
pub use driver::{ContainerStatus, LifecycleDriver, OciDriver, StateLayout};
pub use image::{DirectoryImage, ImageSource};
pub use launcher::{select_launcher, Action, ExecParams, Launcher, NativeLauncher, OciLauncher};
pub use lifecycle::{validate_transition, ContainerState};
pub use lock::{lock_bundle, release_bundle, StateLock, BUNDLE_MARKER};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] vessel_schema::ConfigError),
    #[error("settings error: {0}")]
    Settings(#[from] vessel_schema::SettingsError),
    #[error("runtime error: {0}")]
    Runtime(#[from] vessel_runtime::RuntimeError),
    #[error("CDI error: {0}")]
    Cdi(#[from] vessel_runtime::CdiError),
    #[error("failed to {op} {path}: {source}")]
    Fs {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} is locked by another container operation")]
    Locked(PathBuf),
    #[error("container {0} already exists")]
    AlreadyExists(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("invalid container id '{0}'")]
    InvalidId(String),
    #[error("invalid state transition for container {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("image error: {0}")]
    Image(String),
}

impl CoreError {
    /// Errors caused by what the user asked for rather than by the system.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CoreError::Config(_) | CoreError::Settings(_) | CoreError::InvalidId(_)
        )
    }
}

pub(crate) fn fs_err(
    op: &'static str,
    path: impl Into<PathBuf>,
) -> impl FnOnce(std::io::Error) -> CoreError {
    let path = path.into();
    move |source| CoreError::Fs { op, path, source }
}
