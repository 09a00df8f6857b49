use crate::driver::OciDriver;
use crate::launcher::ExecParams;
use crate::CoreError;
use std::path::Path;
use tracing::debug;
use vessel_runtime::env::{default_env, prefixed_overrides};
use vessel_runtime::envfile::env_file_vars;
use vessel_runtime::idmap::{reverse_user_maps, SubIdRegistry};
use vessel_runtime::{
    resolve_process_env, EnvEvaluator, EnvironmentMap, HostIdentity, IdentitySource,
    ProcessBuilder, Registry, ShellEvaluator,
};
use vessel_schema::{
    BundleSpec, DeviceCgroup, HomeSpec, ImageConfig, LaunchConfig, Mount, Settings,
};

/// Everything needed to turn a validated launch configuration into a bundle
/// spec or a host process.
pub struct BundleAssembler {
    config: LaunchConfig,
    settings: Settings,
    identity: Box<dyn IdentitySource>,
    evaluator: Box<dyn EnvEvaluator>,
    host_env: Vec<(String, String)>,
}

impl BundleAssembler {
    pub fn new(config: LaunchConfig, settings: Settings) -> Self {
        let evaluator = ShellEvaluator::new(settings.shell.clone());
        Self {
            config,
            settings,
            identity: Box::new(HostIdentity),
            evaluator: Box::new(evaluator),
            host_env: std::env::vars().collect(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Box<dyn IdentitySource>) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Box<dyn EnvEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Replace the calling environment consulted for prefixed overrides and
    /// `XDG_RUNTIME_DIR`.
    #[must_use]
    pub fn with_host_env(mut self, host_env: Vec<(String, String)>) -> Self {
        self.host_env = host_env;
        self
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn identity(&self) -> &dyn IdentitySource {
        self.identity.as_ref()
    }

    fn host_var(&self, key: &str) -> Option<&str> {
        self.host_env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The runtime must run inside a user namespace unless we are real root.
    pub fn uses_user_namespace(&self) -> bool {
        self.config.fakeroot() || self.identity.uid() != 0
    }

    /// Bundle-level user namespace with reverse mappings, for unprivileged
    /// launches that keep the caller's identity.
    fn needs_reverse_maps(&self) -> bool {
        !self.config.fakeroot() && self.identity.uid() != 0
    }

    pub fn driver(&self) -> Result<OciDriver, CoreError> {
        OciDriver::from_settings(
            &self.settings,
            self.identity.uid(),
            self.host_var("XDG_RUNTIME_DIR"),
            self.uses_user_namespace(),
        )
    }

    /// Final process environment for `image_name` run from `bundle`.
    pub fn process_env(
        &self,
        image: &ImageConfig,
        image_name: &str,
        bundle: &Path,
    ) -> Result<Vec<String>, CoreError> {
        let mut runtime_env = default_env(image_name, &bundle.to_string_lossy());
        runtime_env.merge(&prefixed_overrides(self.host_env.iter().cloned()));
        if let Some(path) = self.config.env_file() {
            runtime_env.merge(&env_file_vars(path, self.evaluator.as_ref())?);
        }
        let explicit: EnvironmentMap = self
            .config
            .env()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        runtime_env.merge(&explicit);
        Ok(resolve_process_env(image.env(), &runtime_env))
    }

    /// Build the complete bundle spec for `params`.
    pub fn assemble(
        &self,
        image: &ImageConfig,
        image_name: &str,
        params: &ExecParams,
        bundle: &Path,
    ) -> Result<BundleSpec, CoreError> {
        let env = self.process_env(image, image_name, bundle)?;
        let process = ProcessBuilder::new(image, self.identity.as_ref())
            .process(params.process.as_deref())
            .args(&params.args)
            .env(env)
            .fakeroot(self.config.fakeroot())
            .cwd(self.config.cwd())
            .build()?;

        let mut spec = BundleSpec::minimal();
        spec.process = Some(process);

        self.add_namespaces(&mut spec)?;
        // Mounted in order, so /tmp must come before anything bound below it.
        if self.config.writable_tmpfs() {
            spec.mounts
                .push(Mount::tmpfs("/tmp", &["nosuid", "nodev", "mode=1777"]));
        }
        self.add_home_mount(&mut spec)?;
        for bind in self.config.binds() {
            spec.mounts
                .push(Mount::bind(&bind.source, &bind.destination, bind.read_only));
        }
        self.add_cgroups(&mut spec)?;

        if self.config.devices().is_empty() {
            return Ok(spec);
        }
        let dirs = if self.config.cdi_dirs().is_empty() {
            self.settings.cdi_spec_dirs.as_slice()
        } else {
            self.config.cdi_dirs()
        };
        let registry = Registry::new(dirs);
        Ok(registry.inject_devices(&spec, self.config.devices())?)
    }

    fn add_namespaces(&self, spec: &mut BundleSpec) -> Result<(), CoreError> {
        let ns = self.config.namespaces();
        let linux = spec.linux_mut();
        for (enabled, name) in [
            (ns.pid, "pid"),
            (ns.ipc, "ipc"),
            (ns.uts, "uts"),
            (ns.net, "network"),
        ] {
            if enabled {
                linux.add_namespace(name);
            }
        }
        if let Some(hostname) = self.config.hostname() {
            spec.hostname = Some(hostname.to_owned());
        }

        if self.needs_reverse_maps() {
            let uid = self.identity.uid();
            let gid = self.identity.gid();
            let username = match self.identity.username() {
                Ok(name) => Some(name),
                Err(e) => {
                    debug!("looking up subordinate ids by uid {uid} only: {e}");
                    None
                }
            };
            let uid_range = SubIdRegistry::subuid(&self.settings.subuid_file)
                .lookup(uid, username.as_deref())?;
            let gid_range = SubIdRegistry::subgid(&self.settings.subgid_file)
                .lookup(uid, username.as_deref())?;
            let (uid_mappings, gid_mappings) = reverse_user_maps(uid, gid, uid_range, gid_range)?;
            debug!("reverse uid mappings: {uid_mappings:?}");
            let linux = spec.linux_mut();
            linux.add_namespace("user");
            linux.uid_mappings = uid_mappings;
            linux.gid_mappings = gid_mappings;
        } else if ns.user {
            spec.linux_mut().add_namespace("user");
        }
        Ok(())
    }

    fn add_home_mount(&self, spec: &mut BundleSpec) -> Result<(), CoreError> {
        match self.config.home() {
            HomeSpec::Disabled => {}
            HomeSpec::Custom {
                source,
                destination,
            } => {
                let source = match source {
                    Some(s) => s.clone(),
                    None => self.identity.home_dir()?.to_string_lossy().into_owned(),
                };
                spec.mounts.push(Mount::bind(&source, destination, false));
            }
            HomeSpec::Host if self.config.fakeroot() => {
                spec.mounts
                    .push(Mount::tmpfs("/root", &["nosuid", "nodev", "mode=755"]));
            }
            HomeSpec::Host => {
                let home = self.identity.home_dir()?.to_string_lossy().into_owned();
                spec.mounts.push(Mount::bind(&home, &home, false));
            }
        }
        Ok(())
    }

    fn add_cgroups(&self, spec: &mut BundleSpec) -> Result<(), CoreError> {
        let Some(cgroups) = self.config.cgroups() else {
            return Ok(());
        };
        let resources = spec.linux_mut().resources_mut();
        for (key, value) in cgroups {
            if key == "devices" {
                let rules: Vec<DeviceCgroup> = serde_json::from_value(value.clone())?;
                resources.devices.extend(rules);
            } else {
                resources.other.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}
