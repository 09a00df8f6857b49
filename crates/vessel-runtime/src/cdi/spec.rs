use super::name::{parse_kind, validate_device_name};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Hook stages a CDI spec may attach hooks to.
pub const HOOK_STAGES: [&str; 6] = [
    "prestart",
    "createRuntime",
    "createContainer",
    "startContainer",
    "poststart",
    "poststop",
];

/// A CDI spec file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<CdiDevice>,
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub device_nodes: Vec<DeviceNode>,
    #[serde(default)]
    pub hooks: Vec<CdiHook>,
    #[serde(default)]
    pub mounts: Vec<CdiMount>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    #[serde(default)]
    pub host_path: Option<String>,
    #[serde(default, rename = "type")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub major: Option<i64>,
    #[serde(default)]
    pub minor: Option<i64>,
    #[serde(default)]
    pub file_mode: Option<u32>,
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdiMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default, rename = "type")]
    pub mount_type: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdiHook {
    pub hook_name: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub timeout: Option<i64>,
}

impl CdiSpec {
    /// Parse a spec from YAML or JSON text.
    pub fn parse(content: &str) -> Result<Self, String> {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cdi_version.trim().is_empty() {
            return Err("missing cdiVersion".to_owned());
        }
        parse_kind(&self.kind)?;
        self.container_edits.validate()?;
        if self.devices.is_empty() {
            return Err("no devices defined".to_owned());
        }
        let mut seen = BTreeSet::new();
        for device in &self.devices {
            validate_device_name(&device.name)?;
            if !seen.insert(device.name.as_str()) {
                return Err(format!("device '{}' defined more than once", device.name));
            }
            if device.container_edits.is_empty() {
                return Err(format!("device '{}' has no container edits", device.name));
            }
            device
                .container_edits
                .validate()
                .map_err(|e| format!("device '{}': {e}", device.name))?;
        }
        Ok(())
    }
}

impl ContainerEdits {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
            && self.device_nodes.is_empty()
            && self.hooks.is_empty()
            && self.mounts.is_empty()
    }

    fn validate(&self) -> Result<(), String> {
        for entry in &self.env {
            match entry.split_once('=') {
                Some((k, _)) if !k.is_empty() => {}
                _ => return Err(format!("invalid environment variable '{entry}'")),
            }
        }
        for node in &self.device_nodes {
            if node.path.is_empty() {
                return Err("device node without path".to_owned());
            }
            if let Some(t) = node.node_type.as_deref() {
                if !matches!(t, "b" | "c" | "u" | "p") {
                    return Err(format!("device node {}: invalid type '{t}'", node.path));
                }
            }
            if let Some(perms) = node.permissions.as_deref() {
                if perms.is_empty() || !perms.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
                    return Err(format!(
                        "device node {}: invalid permissions '{perms}'",
                        node.path
                    ));
                }
            }
        }
        for mount in &self.mounts {
            if mount.host_path.is_empty() || mount.container_path.is_empty() {
                return Err("mount needs both hostPath and containerPath".to_owned());
            }
        }
        for hook in &self.hooks {
            if !HOOK_STAGES.contains(&hook.hook_name.as_str()) {
                return Err(format!("unknown hook name '{}'", hook.hook_name));
            }
            if hook.path.is_empty() {
                return Err(format!("{} hook without path", hook.hook_name));
            }
        }
        Ok(())
    }
}
