//! Launch configuration, OCI bundle spec types, image metadata, and settings for Vessel.
//!
//! This crate defines the schema layer: validated launch options (`LaunchConfig`)
//! for the OCI and native launchers, the serde representation of the OCI runtime
//! configuration document (`BundleSpec`), the subset of the OCI image
//! configuration used to derive a container process (`ImageConfig`), and the
//! global TOML `Settings` file.

pub mod config;
pub mod image;
pub mod settings;
pub mod spec;

pub use config::{
    BindPath, ConfigError, HomeSpec, LaunchConfig, LaunchOptions, LauncherKind, Namespaces,
};
pub use image::{ImageConfig, ImageProcessConfig};
pub use settings::{Settings, SettingsError, DEFAULT_SETTINGS_PATH};
pub use spec::{
    BundleSpec, DeviceCgroup, Hook, Hooks, IdMapping, Linux, LinuxDevice, Mount, Namespace,
    Process, Resources, Root, User,
};
