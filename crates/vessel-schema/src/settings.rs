use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// System-wide settings file consulted when no `--config` is given.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/vessel/vessel.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("userns_command must not be empty")]
    EmptyUsernsCommand,
}

/// Global settings for the OCI launcher and lifecycle driver.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// OCI runtime executable. When unset the first of crun, runc and youki
    /// found on `PATH` is used.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Base directory for container bookkeeping and runtime state.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_cdi_spec_dirs")]
    pub cdi_spec_dirs: Vec<PathBuf>,
    #[serde(default = "default_subuid_file")]
    pub subuid_file: PathBuf,
    #[serde(default = "default_subgid_file")]
    pub subgid_file: PathBuf,
    /// Command prefix that runs the OCI runtime inside a user namespace with
    /// the invoking user mapped to root and the subordinate range above it.
    #[serde(default = "default_userns_command")]
    pub userns_command: Vec<String>,
    /// Parent directory for temporary bundles.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    /// Shell used to evaluate `--env-file` content.
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: None,
            state_dir: None,
            cdi_spec_dirs: default_cdi_spec_dirs(),
            subuid_file: default_subuid_file(),
            subgid_file: default_subgid_file(),
            userns_command: default_userns_command(),
            tmp_dir: None,
            shell: default_shell(),
        }
    }
}

fn default_cdi_spec_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/etc/cdi"), PathBuf::from("/var/run/cdi")]
}

fn default_subuid_file() -> PathBuf {
    PathBuf::from("/etc/subuid")
}

fn default_subgid_file() -> PathBuf {
    PathBuf::from("/etc/subgid")
}

fn default_userns_command() -> Vec<String> {
    ["unshare", "--user", "--map-root-user", "--map-auto", "--"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/sh")
}

impl Settings {
    pub fn from_toml(input: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(input)?;
        if settings.userns_command.is_empty() {
            return Err(SettingsError::EmptyUsernsCommand);
        }
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Load [`DEFAULT_SETTINGS_PATH`], falling back to built-in defaults when
    /// the file does not exist.
    pub fn load_default() -> Result<Self, SettingsError> {
        let path = Path::new(DEFAULT_SETTINGS_PATH);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Base state directory: the configured one, `/run/vessel-oci` for root,
    /// otherwise below the user's runtime directory.
    pub fn resolve_state_dir(&self, uid: u32, xdg_runtime_dir: Option<&str>) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        if uid == 0 {
            return PathBuf::from("/run/vessel-oci");
        }
        match xdg_runtime_dir {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("vessel-oci"),
            _ => PathBuf::from(format!("/tmp/vessel-oci-{uid}")),
        }
    }
}
