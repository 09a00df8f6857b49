//! Process and device preparation plus OCI runtime invocation for Vessel.
//!
//! This crate turns a validated launch configuration into the pieces of an OCI
//! bundle spec: the merged container environment (`env`, `envfile`), the
//! container process (`process`), reverse user-namespace ID mappings for
//! rootless launches (`idmap`), and CDI device injection (`cdi`). It also wraps
//! the external OCI runtime executable (`oci`) and the process-wide shutdown
//! flag used to cancel blocking evaluation (`concurrency`).

pub mod cdi;
pub mod concurrency;
pub mod env;
pub mod envfile;
pub mod idmap;
pub mod oci;
pub mod process;

pub use cdi::{CdiError, QualifiedName, Registry};
pub use concurrency::{install_signal_handler, shutdown_requested};
pub use env::{resolve_process_env, EnvironmentMap, CONTAINER_LIBS, ENV_PREFIX};
pub use envfile::{EnvEvaluator, ShellEvaluator};
pub use idmap::{reverse_id_map, reverse_user_maps, IdRange, SubIdRegistry, MIN_SUBID_RANGE};
pub use oci::{OciRuntime, RuntimeState};
pub use process::{HostIdentity, IdentitySource, ProcessBuilder, StaticIdentity};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity lookup failed: {0}")]
    Identity(String),
    #[error("failed to read {path}: {source}")]
    SubIdRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no {kind} range for user {user} in {path}")]
    SubIdNotFound {
        kind: &'static str,
        user: String,
        path: PathBuf,
    },
    #[error("{kind} range size ({size}) must be at least {min}")]
    RangeTooSmall {
        kind: &'static str,
        size: u32,
        min: u32,
    },
    #[error("could not read environment file {path}: {source}")]
    EnvFileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("while processing {path}: {reason}")]
    EnvFileEval { path: PathBuf, reason: String },
    #[error("shell evaluation failed: {0}")]
    ShellEval(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("CDI error: {0}")]
    Cdi(#[from] CdiError),
    #[error("no OCI runtime found (crun/runc/youki)")]
    RuntimeNotFound,
    #[error("failed to execute {program} for {verb}: {source}")]
    Spawn {
        verb: String,
        program: String,
        source: std::io::Error,
    },
    #[error("{verb} of container {id} failed with exit code {code}{}", stderr_suffix(.stderr))]
    CommandFailed {
        verb: String,
        id: String,
        code: i32,
        stderr: String,
    },
    #[error("failed to parse runtime state of {id}: {reason}")]
    StateParse { id: String, reason: String },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}
