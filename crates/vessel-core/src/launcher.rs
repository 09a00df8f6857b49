use crate::bundle::BundleAssembler;
use crate::driver::LifecycleDriver;
use crate::image::{DirectoryImage, ImageSource};
use crate::{fs_err, CoreError};
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;
use tracing::info;
use vessel_runtime::oci::exit_code;
use vessel_runtime::process::process_args;
use vessel_runtime::RuntimeError;
use vessel_schema::LauncherKind;

/// Shell started by the `shell` action when none is configured.
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Exec,
    Run,
    Shell,
}

/// What to run in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParams {
    pub image: PathBuf,
    pub action: Action,
    /// Replaces the image entrypoint (and cmd) when set.
    pub process: Option<String>,
    pub args: Vec<String>,
}

impl ExecParams {
    /// Run `argv` in the image, ignoring its entrypoint.
    pub fn exec(image: impl Into<PathBuf>, argv: &[String]) -> Self {
        let (process, args) = match argv.split_first() {
            Some((first, rest)) => (Some(first.clone()), rest.to_vec()),
            None => (None, Vec::new()),
        };
        Self {
            image: image.into(),
            action: Action::Exec,
            process,
            args,
        }
    }

    /// Run the image's own entrypoint/cmd, with `args` replacing cmd.
    pub fn run(image: impl Into<PathBuf>, args: &[String]) -> Self {
        Self {
            image: image.into(),
            action: Action::Run,
            process: None,
            args: args.to_vec(),
        }
    }

    pub fn shell(image: impl Into<PathBuf>, shell: Option<&str>) -> Self {
        Self {
            image: image.into(),
            action: Action::Shell,
            process: Some(shell.unwrap_or(DEFAULT_SHELL).to_owned()),
            args: Vec::new(),
        }
    }
}

pub trait Launcher {
    fn name(&self) -> &'static str;

    /// Run `params` to completion and return the exit code.
    fn exec(&self, params: &ExecParams) -> Result<i32, CoreError>;
}

/// Pick the launcher matching the configuration's launcher kind.
pub fn select_launcher(assembler: BundleAssembler) -> Box<dyn Launcher> {
    match assembler.config().kind() {
        LauncherKind::Oci => Box::new(OciLauncher::new(assembler)),
        LauncherKind::Native => Box::new(NativeLauncher::new(assembler)),
    }
}

/// Runs images through an OCI runtime using a temporary bundle.
pub struct OciLauncher {
    assembler: BundleAssembler,
}

impl OciLauncher {
    pub fn new(assembler: BundleAssembler) -> Self {
        Self { assembler }
    }

    fn bundle_dir(&self) -> Result<TempDir, CoreError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vessel-bundle-");
        match &self.assembler.settings().tmp_dir {
            Some(dir) => builder.tempdir_in(dir).map_err(fs_err("create bundle in", dir)),
            None => builder
                .tempdir()
                .map_err(fs_err("create bundle in", std::env::temp_dir())),
        }
    }
}

impl Launcher for OciLauncher {
    fn name(&self) -> &'static str {
        "oci"
    }

    fn exec(&self, params: &ExecParams) -> Result<i32, CoreError> {
        let image = DirectoryImage::open(&params.image)?;
        let image_config = image.config()?;

        let tmp = self.bundle_dir()?;
        let bundle = tmp.path();
        let rootfs = std::fs::canonicalize(image.rootfs()).map_err(fs_err("resolve", image.rootfs()))?;
        let link = bundle.join("rootfs");
        std::os::unix::fs::symlink(&rootfs, &link).map_err(fs_err("link", &link))?;

        let spec = self
            .assembler
            .assemble(&image_config, image.name(), params, bundle)?;
        if !spec.process.as_ref().is_some_and(|p| !p.args.is_empty()) {
            return Err(CoreError::Image(format!(
                "{} defines no command to run",
                image.name()
            )));
        }

        let driver = self.assembler.driver()?;
        let id = uuid::Uuid::new_v4().to_string();
        info!("launching {} as container {id}", image.name());
        driver.run(&id, bundle, &spec)
    }
}

/// Runs the resolved process directly on the host, without isolation.
pub struct NativeLauncher {
    assembler: BundleAssembler,
}

impl NativeLauncher {
    pub fn new(assembler: BundleAssembler) -> Self {
        Self { assembler }
    }
}

impl Launcher for NativeLauncher {
    fn name(&self) -> &'static str {
        "native"
    }

    fn exec(&self, params: &ExecParams) -> Result<i32, CoreError> {
        let image = DirectoryImage::open(&params.image)?;
        let image_config = image.config()?;
        let env = self
            .assembler
            .process_env(&image_config, image.name(), image.dir())?;
        let argv = process_args(&image_config, params.process.as_deref(), &params.args);
        let Some((program, args)) = argv.split_first() else {
            return Err(CoreError::Image(format!(
                "{} defines no command to run",
                image.name()
            )));
        };

        info!("running {program} natively for {}", image.name());
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env.iter().filter_map(|e| e.split_once('=')));
        if let Some(cwd) = self.assembler.config().cwd() {
            cmd.current_dir(cwd);
        }
        let status = cmd.status().map_err(|e| RuntimeError::Spawn {
            verb: "exec".to_owned(),
            program: program.clone(),
            source: e,
        })?;
        Ok(exit_code(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use vessel_runtime::process::StaticIdentity;
    use vessel_schema::{LaunchConfig, LaunchOptions, Settings};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn root_identity() -> Box<StaticIdentity> {
        Box::new(StaticIdentity {
            uid: 0,
            gid: 0,
            name: "root".to_owned(),
            home: PathBuf::from("/root"),
        })
    }

    fn assembler(options: LaunchOptions, kind: LauncherKind) -> BundleAssembler {
        let config = LaunchConfig::new(options, kind).unwrap();
        BundleAssembler::new(config, Settings::default())
            .with_identity(root_identity())
            .with_host_env(Vec::new())
    }

    fn image_dir(root: &Path, config: &str) -> PathBuf {
        let dir = root.join("img");
        std::fs::create_dir_all(dir.join("rootfs")).unwrap();
        std::fs::write(dir.join("config.json"), config).unwrap();
        dir
    }

    #[test]
    fn exec_params_constructors() {
        let p = ExecParams::exec("/img", &strings(&["ls", "-l"]));
        assert_eq!(p.process.as_deref(), Some("ls"));
        assert_eq!(p.args, strings(&["-l"]));

        let p = ExecParams::run("/img", &strings(&["x"]));
        assert_eq!(p.process, None);
        assert_eq!(p.action, Action::Run);

        let p = ExecParams::shell("/img", None);
        assert_eq!(p.process.as_deref(), Some(DEFAULT_SHELL));
        let p = ExecParams::shell("/img", Some("/bin/bash"));
        assert_eq!(p.process.as_deref(), Some("/bin/bash"));
    }

    #[test]
    fn selects_launcher_by_kind() {
        let oci = select_launcher(assembler(LaunchOptions::default(), LauncherKind::Oci));
        assert_eq!(oci.name(), "oci");
        let native = select_launcher(assembler(LaunchOptions::default(), LauncherKind::Native));
        assert_eq!(native.name(), "native");
    }

    #[test]
    fn native_launcher_returns_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_dir(dir.path(), r#"{"config":{"Entrypoint":["/bin/sh","-c"],"Cmd":["exit 3"]}}"#);
        let launcher = NativeLauncher::new(assembler(LaunchOptions::default(), LauncherKind::Native));
        assert_eq!(launcher.exec(&ExecParams::run(&img, &[])).unwrap(), 3);
    }

    #[test]
    fn native_launcher_passes_resolved_env() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_dir(dir.path(), r#"{"config":{"Env":["PATH=/usr/bin:/bin","FOO=image"]}}"#);
        let options = LaunchOptions {
            env: strings(&["FOO=explicit"]),
            ..LaunchOptions::default()
        };
        let launcher = NativeLauncher::new(assembler(options, LauncherKind::Native));
        let argv = strings(&[
            "/bin/sh",
            "-c",
            r#"[ "$FOO" = explicit ] && [ "$VESSEL_NAME" = img ] && [ "$LD_LIBRARY_PATH" = /.vessel.d/libs ]"#,
        ]);
        assert_eq!(launcher.exec(&ExecParams::exec(&img, &argv)).unwrap(), 0);
    }

    #[test]
    fn native_launcher_without_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_dir(dir.path(), "{}");
        let launcher = NativeLauncher::new(assembler(LaunchOptions::default(), LauncherKind::Native));
        let err = launcher.exec(&ExecParams::run(&img, &[])).unwrap_err();
        assert!(matches!(err, CoreError::Image(_)));
    }
}
