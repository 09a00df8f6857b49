use super::spec::{CdiHook, CdiSpec, ContainerEdits, DeviceNode};
use super::{CdiError, QualifiedName};
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vessel_schema::{BundleSpec, DeviceCgroup, Hook, LinuxDevice, Mount};

const SPEC_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

struct LoadedSpec {
    path: PathBuf,
    spec: CdiSpec,
}

#[derive(Clone, Copy)]
struct DeviceRef {
    spec: usize,
    device: usize,
    priority: usize,
}

/// Devices loaded from a set of CDI spec directories. Later directories take
/// priority over earlier ones.
pub struct Registry {
    specs: Vec<LoadedSpec>,
    devices: BTreeMap<String, DeviceRef>,
    errors: Vec<CdiError>,
}

impl Registry {
    /// Scan `dirs` for spec files. Missing directories are ignored; unreadable
    /// or invalid specs are skipped and reported through [`Registry::errors`].
    pub fn new<P: AsRef<Path>>(dirs: &[P]) -> Self {
        let mut registry = Self {
            specs: Vec::new(),
            devices: BTreeMap::new(),
            errors: Vec::new(),
        };
        let mut conflicted: BTreeMap<String, PathBuf> = BTreeMap::new();

        for (priority, dir) in dirs.iter().enumerate() {
            let dir = dir.as_ref();
            for path in spec_files(dir) {
                let spec = match load_spec(&path) {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!("skipping CDI spec: {e}");
                        registry.errors.push(e);
                        continue;
                    }
                };
                debug!("loaded CDI spec {} ({})", path.display(), spec.kind);
                let spec_idx = registry.specs.len();
                for (device_idx, device) in spec.devices.iter().enumerate() {
                    let qualified = format!("{}={}", spec.kind, device.name);
                    let new_ref = DeviceRef {
                        spec: spec_idx,
                        device: device_idx,
                        priority,
                    };
                    match registry.devices.get(&qualified) {
                        Some(existing) if existing.priority == priority => {
                            warn!("CDI device {qualified} defined twice in {}", dir.display());
                            conflicted.insert(qualified, dir.to_path_buf());
                        }
                        _ => {
                            conflicted.remove(&qualified);
                            registry.devices.insert(qualified, new_ref);
                        }
                    }
                }
                registry.specs.push(LoadedSpec { path, spec });
            }
        }

        for (name, dir) in conflicted {
            registry.devices.remove(&name);
            registry.errors.push(CdiError::Conflict { name, dir });
        }
        registry
    }

    /// Fully qualified names of every resolvable device, sorted.
    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn errors(&self) -> &[CdiError] {
        &self.errors
    }

    /// Return a copy of `spec` with the edits of every device in `names`
    /// applied. On error `spec` is untouched and nothing is returned.
    pub fn inject_devices(
        &self,
        spec: &BundleSpec,
        names: &[String],
    ) -> Result<BundleSpec, CdiError> {
        let mut requested = Vec::with_capacity(names.len());
        for name in names {
            let qualified = QualifiedName::parse(name)?.to_string();
            if !requested.contains(&qualified) {
                requested.push(qualified);
            }
        }

        let unresolved: Vec<String> = requested
            .iter()
            .filter(|n| !self.devices.contains_key(*n))
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            return Err(CdiError::UnresolvableDevices(unresolved));
        }

        let mut edits: Vec<&ContainerEdits> = Vec::new();
        let mut seen_specs = BTreeSet::new();
        for name in &requested {
            let r = self.devices[name];
            let loaded = &self.specs[r.spec];
            if seen_specs.insert(r.spec) {
                edits.push(&loaded.spec.container_edits);
            }
            edits.push(&loaded.spec.devices[r.device].container_edits);
            debug!("injecting CDI device {name} from {}", loaded.path.display());
        }

        let mut out = spec.clone();
        let mut added_mounts = false;
        for e in edits {
            apply_edits(&mut out, e)?;
            added_mounts |= !e.mounts.is_empty();
        }
        if added_mounts {
            out.mounts.sort_by(|a, b| a.destination.cmp(&b.destination));
        }
        Ok(out)
    }
}

fn spec_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("CDI spec dir {} not readable: {e}", dir.display());
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| SPEC_EXTENSIONS.contains(&ext))
        })
        .collect();
    files.sort();
    files
}

fn load_spec(path: &Path) -> Result<CdiSpec, CdiError> {
    let content = std::fs::read_to_string(path).map_err(|e| CdiError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let invalid = |reason: String| CdiError::InvalidSpec {
        path: path.to_path_buf(),
        reason,
    };
    let spec = CdiSpec::parse(&content).map_err(invalid)?;
    spec.validate().map_err(invalid)?;
    Ok(spec)
}

fn apply_edits(spec: &mut BundleSpec, edits: &ContainerEdits) -> Result<(), CdiError> {
    if !edits.env.is_empty() {
        let process = spec.process_mut();
        for entry in &edits.env {
            if let Some((k, v)) = entry.split_once('=') {
                process.set_env(k, v);
            }
        }
    }

    for node in &edits.device_nodes {
        let device = fill_device(node)?;
        let linux = spec.linux_mut();
        linux.devices.retain(|d| d.path != device.path);
        if device.device_type != "p" {
            linux.resources_mut().devices.push(DeviceCgroup {
                allow: true,
                device_type: Some(device.device_type.clone()),
                major: Some(device.major),
                minor: Some(device.minor),
                access: Some(
                    node.permissions
                        .clone()
                        .unwrap_or_else(|| "rwm".to_owned()),
                ),
            });
        }
        linux.devices.push(device);
    }

    for m in &edits.mounts {
        spec.mounts.push(Mount {
            destination: m.container_path.clone(),
            mount_type: m.mount_type.clone(),
            source: Some(m.host_path.clone()),
            options: m.options.clone(),
        });
    }

    for hook in &edits.hooks {
        add_hook(spec, hook)?;
    }
    Ok(())
}

fn add_hook(spec: &mut BundleSpec, hook: &CdiHook) -> Result<(), CdiError> {
    let hooks = spec.hooks_mut();
    let stage = match hook.hook_name.as_str() {
        "prestart" => &mut hooks.prestart,
        "createRuntime" => &mut hooks.create_runtime,
        "createContainer" => &mut hooks.create_container,
        "startContainer" => &mut hooks.start_container,
        "poststart" => &mut hooks.poststart,
        "poststop" => &mut hooks.poststop,
        other => {
            return Err(CdiError::UnknownHook {
                stage: other.to_owned(),
                path: hook.path.clone(),
            })
        }
    };
    stage.push(Hook {
        path: hook.path.clone(),
        args: hook.args.clone(),
        env: hook.env.clone(),
        timeout: hook.timeout,
    });
    Ok(())
}

/// Complete a device node from the host when type or numbers are missing.
/// Nodes with an explicit type and non-zero major, and fifos, are taken as
/// given.
fn fill_device(node: &DeviceNode) -> Result<LinuxDevice, CdiError> {
    let mut device_type = node.node_type.clone().unwrap_or_default();
    let mut major = node.major.unwrap_or(0);
    let mut minor = node.minor.unwrap_or(0);
    let mut file_mode = node.file_mode;

    if device_type.is_empty() || (major == 0 && device_type != "p") {
        let host_path = node.host_path.as_deref().unwrap_or(&node.path);
        let meta = std::fs::metadata(host_path).map_err(|e| CdiError::DeviceStat {
            path: host_path.to_owned(),
            source: e,
        })?;
        let ft = meta.file_type();
        let host_type = if ft.is_block_device() {
            "b"
        } else if ft.is_char_device() {
            "c"
        } else if ft.is_fifo() {
            "p"
        } else {
            return Err(CdiError::NotADevice {
                path: host_path.to_owned(),
            });
        };
        if device_type.is_empty() {
            host_type.clone_into(&mut device_type);
        }
        if host_type != "p" {
            (major, minor) = device_numbers(meta.rdev());
        }
        if file_mode.is_none() {
            file_mode = Some(meta.mode() & 0o777);
        }
    }

    Ok(LinuxDevice {
        path: node.path.clone(),
        device_type,
        major,
        minor,
        file_mode,
        uid: node.uid,
        gid: node.gid,
    })
}

fn device_numbers(rdev: libc::dev_t) -> (i64, i64) {
    (i64::from(libc::major(rdev)), i64::from(libc::minor(rdev)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const KIND: &str = "vendor.example.org/test";

    fn write_spec(dir: &Path, file: &str, device: &str, env: &str) {
        fs::write(
            dir.join(file),
            format!(
                "cdiVersion: \"0.5.0\"\nkind: {KIND}\ndevices:\n  - name: {device}\n    containerEdits:\n      env: [\"{env}\"]\n"
            ),
        )
        .unwrap();
    }

    fn base_spec() -> BundleSpec {
        let mut spec = BundleSpec::default();
        spec.process_mut().set_env("PATH", "/bin");
        spec
    }

    #[test]
    fn later_dirs_take_priority() {
        let low = tempfile::tempdir().unwrap();
        let high = tempfile::tempdir().unwrap();
        write_spec(low.path(), "a.yaml", "dev", "SRC=low");
        write_spec(high.path(), "a.yaml", "dev", "SRC=high");

        let reg = Registry::new(&[low.path(), high.path()]);
        assert!(reg.errors().is_empty());
        let out = reg
            .inject_devices(&base_spec(), &[format!("{KIND}=dev")])
            .unwrap();
        assert_eq!(out.process.unwrap().get_env("SRC"), Some("high"));
    }

    #[test]
    fn same_dir_conflict_drops_device() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(dir.path(), "a.yaml", "dev", "SRC=a");
        write_spec(dir.path(), "b.yaml", "dev", "SRC=b");
        write_spec(dir.path(), "c.yaml", "other", "SRC=c");

        let reg = Registry::new(&[dir.path()]);
        assert_eq!(reg.device_names(), vec![format!("{KIND}=other")]);
        assert!(matches!(reg.errors(), [CdiError::Conflict { .. }]));
    }

    #[test]
    fn conflict_resolved_by_higher_priority_dir() {
        let low = tempfile::tempdir().unwrap();
        let high = tempfile::tempdir().unwrap();
        write_spec(low.path(), "a.yaml", "dev", "SRC=a");
        write_spec(low.path(), "b.yaml", "dev", "SRC=b");
        write_spec(high.path(), "c.json", "dev", "SRC=high");

        let reg = Registry::new(&[low.path(), high.path()]);
        assert_eq!(reg.device_names(), vec![format!("{KIND}=dev")]);
        assert!(reg.errors().is_empty());
    }

    #[test]
    fn invalid_specs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(dir.path(), "good.yaml", "dev", "A=1");
        fs::write(dir.path().join("bad.json"), "{ not valid").unwrap();
        fs::write(dir.path().join("ignored.txt"), "whatever").unwrap();

        let reg = Registry::new(&[dir.path()]);
        assert_eq!(reg.device_names().len(), 1);
        assert_eq!(reg.errors().len(), 1);
        assert!(matches!(reg.errors()[0], CdiError::InvalidSpec { .. }));
    }

    #[test]
    fn missing_dir_is_not_an_error() {
        let reg = Registry::new(&["/nonexistent/cdi/dir"]);
        assert!(reg.device_names().is_empty());
        assert!(reg.errors().is_empty());
    }

    #[test]
    fn invalid_name_is_rejected_before_lookup() {
        let reg = Registry::new::<&str>(&[]);
        let err = reg
            .inject_devices(&base_spec(), &["not-a-device".to_owned()])
            .unwrap_err();
        assert!(matches!(err, CdiError::InvalidName { .. }));
    }

    #[test]
    fn device_node_from_host() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("devnull.yaml"),
            format!(
                "cdiVersion: \"0.5.0\"\nkind: {KIND}\ndevices:\n  - name: devnull\n    containerEdits:\n      deviceNodes:\n        - path: /dev/null\n"
            ),
        )
        .unwrap();

        let reg = Registry::new(&[dir.path()]);
        let out = reg
            .inject_devices(&base_spec(), &[format!("{KIND}=devnull")])
            .unwrap();
        let linux = out.linux.unwrap();
        let dev = &linux.devices[0];
        assert_eq!(dev.path, "/dev/null");
        assert_eq!(dev.device_type, "c");
        assert_eq!((dev.major, dev.minor), (1, 3));
        let rule = &linux.resources.unwrap().devices[0];
        assert!(rule.allow);
        assert_eq!(rule.access.as_deref(), Some("rwm"));
        assert_eq!(rule.major, Some(1));
    }

    #[test]
    fn stat_failure_leaves_spec_untouched() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("ghost.yaml"),
            format!(
                "cdiVersion: \"0.5.0\"\nkind: {KIND}\ncontainerEdits:\n  env: [\"TOP=1\"]\ndevices:\n  - name: ghost\n    containerEdits:\n      deviceNodes:\n        - path: /dev/does-not-exist-vessel\n"
            ),
        )
        .unwrap();

        let reg = Registry::new(&[dir.path()]);
        let spec = base_spec();
        let err = reg
            .inject_devices(&spec, &[format!("{KIND}=ghost")])
            .unwrap_err();
        assert!(matches!(err, CdiError::DeviceStat { .. }));
        assert_eq!(spec, base_spec());
    }

    #[test]
    fn dev_t_decoding() {
        assert_eq!(device_numbers(libc::makedev(1, 3)), (1, 3));
        assert_eq!(device_numbers(libc::makedev(259, 65536)), (259, 65536));
    }
}
