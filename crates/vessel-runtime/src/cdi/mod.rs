//! Container Device Interface support.
//!
//! CDI spec files declare named devices as sets of container edits (env vars,
//! device nodes, mounts, hooks). [`Registry`] loads them from a list of
//! directories and [`Registry::inject_devices`] applies the edits for a set of
//! fully qualified device names to a bundle spec.

mod name;
mod registry;
mod spec;

pub use name::QualifiedName;
pub use registry::Registry;
pub use spec::{CdiDevice, CdiHook, CdiMount, CdiSpec, ContainerEdits, DeviceNode};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdiError {
    #[error("invalid CDI device name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("unresolvable CDI devices: {}", .0.join(", "))]
    UnresolvableDevices(Vec<String>),
    #[error("failed to read CDI spec {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid CDI spec {path}: {reason}")]
    InvalidSpec { path: PathBuf, reason: String },
    #[error("CDI device {name} conflicts with another device in {dir}")]
    Conflict { name: String, dir: PathBuf },
    #[error("failed to stat device node {path}: {source}")]
    DeviceStat {
        path: String,
        source: std::io::Error,
    },
    #[error("{path} is not a device node")]
    NotADevice { path: String },
    #[error("invalid {stage} hook {path}: unknown hook name")]
    UnknownHook { stage: String, path: String },
}
