use crate::lifecycle::{validate_transition, ContainerState};
use crate::lock::{lock_bundle, release_bundle, StateLock};
use crate::{fs_err, CoreError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vessel_runtime::{OciRuntime, RuntimeError};
use vessel_schema::{BundleSpec, Settings};

/// On-disk layout below the state directory.
///
/// ```text
/// <base>/containers/<id>/bundle -> <bundle dir>
/// <base>/containers/<id>/lock
/// <base>/runtime/                 (runtime --root)
/// ```
#[derive(Debug, Clone)]
pub struct StateLayout {
    base: PathBuf,
}

impl StateLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.base.join("containers")
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.base.join("runtime")
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    pub fn bundle_link(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("bundle")
    }

    pub fn lock_file(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("lock")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub bundle: PathBuf,
}

/// Drives a container through `Absent -> Created -> Running -> Stopped -> Absent`.
pub trait LifecycleDriver {
    fn create(&self, id: &str, bundle: &Path, spec: &BundleSpec) -> Result<(), CoreError>;

    fn start(&self, id: &str) -> Result<(), CoreError>;

    fn kill(&self, id: &str, signal: &str) -> Result<(), CoreError>;

    fn state(&self, id: &str) -> Result<ContainerStatus, CoreError>;

    fn delete(&self, id: &str) -> Result<(), CoreError>;

    /// Create, start and wait for the container in the foreground, then
    /// remove its bookkeeping. Returns the container's exit code.
    fn run(&self, id: &str, bundle: &Path, spec: &BundleSpec) -> Result<i32, CoreError>;
}

pub struct OciDriver {
    runtime: OciRuntime,
    layout: StateLayout,
}

impl OciDriver {
    pub fn new(runtime: OciRuntime, layout: StateLayout) -> Self {
        Self { runtime, layout }
    }

    /// Driver rooted at the configured (or default) state directory. With
    /// `userns` the runtime is started through the user-namespace helper.
    pub fn from_settings(
        settings: &Settings,
        uid: u32,
        xdg_runtime_dir: Option<&str>,
        userns: bool,
    ) -> Result<Self, CoreError> {
        let layout = StateLayout::new(settings.resolve_state_dir(uid, xdg_runtime_dir));
        let mut runtime = OciRuntime::detect(settings.runtime.as_deref(), layout.runtime_root())?;
        if userns {
            runtime = runtime.with_wrapper(settings.userns_command.clone());
        }
        debug!(
            "OCI driver: runtime={} state={}",
            runtime.program(),
            layout.base().display()
        );
        Ok(Self::new(runtime, layout))
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn runtime(&self) -> &OciRuntime {
        &self.runtime
    }

    fn require(&self, id: &str) -> Result<PathBuf, CoreError> {
        validate_container_id(id)?;
        let link = self.layout.bundle_link(id);
        if link.symlink_metadata().is_ok() {
            Ok(link)
        } else {
            Err(CoreError::NotFound(id.to_owned()))
        }
    }

    /// Turn a runtime refusal into an invalid-transition error when the
    /// container's current state explains it. Only consulted after a failure,
    /// so a successful call costs a single runtime invocation.
    fn explain_rejection(&self, id: &str, to: ContainerState, err: RuntimeError) -> CoreError {
        if matches!(err, RuntimeError::CommandFailed { .. }) {
            if let Ok(status) = self.state(id) {
                if let Err(invalid) = validate_transition(id, status.state, to) {
                    return invalid;
                }
            }
        }
        err.into()
    }

    /// Set up bookkeeping for a new container under its state lock, then run
    /// `launch`. Everything set up here is rolled back if any step fails.
    fn with_new_container<T>(
        &self,
        id: &str,
        bundle: &Path,
        spec: &BundleSpec,
        launch: impl FnOnce(&Path) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        validate_container_id(id)?;
        let bundle = fs::canonicalize(bundle).map_err(fs_err("resolve", bundle))?;

        for dir in [self.layout.containers_dir(), self.layout.runtime_root()] {
            fs::create_dir_all(&dir).map_err(fs_err("create", &dir))?;
        }
        let dir = self.layout.container_dir(id);
        let created_dir = match fs::create_dir(&dir) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => return Err(fs_err("create", dir)(e)),
        };

        let _lock = StateLock::try_acquire(&self.layout.lock_file(id))?;

        let result = self.claim_and_launch(id, &bundle, spec, launch);
        if result.is_err() && created_dir {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("failed to remove state directory {}: {e}", dir.display());
            }
        }
        result
    }

    fn claim_and_launch<T>(
        &self,
        id: &str,
        bundle: &Path,
        spec: &BundleSpec,
        launch: impl FnOnce(&Path) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let link = self.layout.bundle_link(id);
        if link.symlink_metadata().is_ok() {
            return Err(CoreError::AlreadyExists(id.to_owned()));
        }

        lock_bundle(bundle)?;
        let result = write_bundle(bundle, spec, &link).and_then(|()| launch(bundle));
        if result.is_err() {
            let _ = fs::remove_file(&link);
            if let Err(e) = release_bundle(bundle) {
                warn!("failed to release bundle {}: {e}", bundle.display());
            }
        }
        result
    }

    /// Remove the bundle link, marker and state directory. Caller holds the
    /// state lock.
    fn remove_bookkeeping(&self, id: &str) -> Result<(), CoreError> {
        let link = self.layout.bundle_link(id);
        let bundle = fs::canonicalize(&link).map_err(fs_err("resolve", &link))?;
        fs::remove_file(&link).map_err(fs_err("remove", &link))?;
        release_bundle(&bundle)?;
        let dir = self.layout.container_dir(id);
        fs::remove_dir_all(&dir).map_err(fs_err("remove", &dir))?;
        Ok(())
    }
}

fn write_bundle(bundle: &Path, spec: &BundleSpec, link: &Path) -> Result<(), CoreError> {
    let config_path = bundle.join("config.json");
    let json = serde_json::to_string_pretty(spec)?;
    fs::write(&config_path, json).map_err(fs_err("write", &config_path))?;
    std::os::unix::fs::symlink(bundle, link).map_err(fs_err("link", link))?;
    Ok(())
}

/// Container IDs become path components and runtime arguments.
pub fn validate_container_id(id: &str) -> Result<(), CoreError> {
    let valid = !id.is_empty()
        && !id.starts_with(['.', '-'])
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidId(id.to_owned()))
    }
}

impl LifecycleDriver for OciDriver {
    fn create(&self, id: &str, bundle: &Path, spec: &BundleSpec) -> Result<(), CoreError> {
        info!("creating container {id} from {}", bundle.display());
        self.with_new_container(id, bundle, spec, |b| {
            self.runtime.create(id, b)?;
            Ok(())
        })
    }

    fn start(&self, id: &str) -> Result<(), CoreError> {
        info!("starting container {id}");
        self.require(id)?;
        self.runtime
            .start(id)
            .map_err(|e| self.explain_rejection(id, ContainerState::Running, e))
    }

    fn kill(&self, id: &str, signal: &str) -> Result<(), CoreError> {
        info!("sending {signal} to container {id}");
        self.require(id)?;
        self.runtime
            .kill(id, signal)
            .map_err(|e| self.explain_rejection(id, ContainerState::Stopped, e))
    }

    fn state(&self, id: &str) -> Result<ContainerStatus, CoreError> {
        let link = self.require(id)?;
        let rs = self.runtime.state(id)?;
        let state = ContainerState::from_runtime_status(&rs.status).ok_or_else(|| {
            RuntimeError::StateParse {
                id: id.to_owned(),
                reason: format!("unknown status '{}'", rs.status),
            }
        })?;
        let bundle = fs::read_link(&link).map_err(fs_err("read", &link))?;
        Ok(ContainerStatus {
            id: id.to_owned(),
            state,
            pid: rs.pid.filter(|p| *p != 0),
            bundle,
        })
    }

    fn delete(&self, id: &str) -> Result<(), CoreError> {
        info!("deleting container {id}");
        self.require(id)?;
        let _lock = StateLock::acquire(&self.layout.lock_file(id))?;
        // Another delete may have finished while we waited for the lock.
        self.require(id)?;
        self.runtime.delete(id)?;
        self.remove_bookkeeping(id)
    }

    fn run(&self, id: &str, bundle: &Path, spec: &BundleSpec) -> Result<i32, CoreError> {
        info!("running container {id} from {}", bundle.display());
        self.with_new_container(id, bundle, spec, |_| Ok(()))?;

        let result = self.runtime.run(id, bundle);
        let _lock = StateLock::acquire(&self.layout.lock_file(id))?;
        self.remove_bookkeeping(id)?;
        let code = result?;
        debug!("container {id} exited with {code}");
        Ok(code)
    }
}
