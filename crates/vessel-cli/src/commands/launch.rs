use super::exit_status;
use clap::Args;
use std::path::PathBuf;
use tracing::debug;
use vessel_core::{select_launcher, BundleAssembler, CoreError, ExecParams};
use vessel_schema::{LaunchConfig, LaunchOptions, LauncherKind, Namespaces, Settings};

/// Launch options shared by `exec`, `run` and `shell`.
#[derive(Debug, Clone, Default, Args)]
pub struct LaunchArgs {
    /// Run through an OCI runtime instead of directly on the host.
    #[arg(long)]
    pub oci: bool,

    /// Home directory: `dest` or `src:dest`.
    #[arg(short = 'H', long)]
    pub home: Option<String>,
    #[arg(long)]
    pub no_home: bool,
    /// Bind mount `src[:dest[:ro|rw]]`, comma separated or repeated.
    #[arg(short = 'B', long = "bind")]
    pub bind: Vec<String>,
    /// Set `KEY=VALUE` in the container environment.
    #[arg(long)]
    pub env: Vec<String>,
    /// Shell file whose assignments are added to the environment.
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// CDI device name, `vendor/class=name`.
    #[arg(long)]
    pub device: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub cdi_dirs: Vec<PathBuf>,
    /// JSON file with cgroup controller settings.
    #[arg(long)]
    pub apply_cgroups: Option<PathBuf>,
    #[arg(long)]
    pub security: Vec<String>,

    #[arg(short = 'u', long)]
    pub userns: bool,
    #[arg(long)]
    pub uts: bool,
    #[arg(short = 'p', long)]
    pub pid: bool,
    #[arg(short = 'i', long)]
    pub ipc: bool,
    #[arg(short = 'n', long)]
    pub net: bool,
    #[arg(long)]
    pub hostname: Option<String>,

    #[arg(short = 'f', long)]
    pub fakeroot: bool,
    #[arg(long)]
    pub writable_tmpfs: bool,
    #[arg(long, alias = "pwd")]
    pub cwd: Option<String>,
    /// Shell started by `shell` (native launcher only).
    #[arg(long)]
    pub shell: Option<String>,

    #[arg(short = 'w', long)]
    pub writable: bool,
    #[arg(long)]
    pub overlay: Vec<String>,
    #[arg(long)]
    pub boot: bool,
    #[arg(long)]
    pub app: Option<String>,
    #[arg(long)]
    pub network: Option<String>,
    #[arg(long)]
    pub dns: Option<String>,
    #[arg(long)]
    pub add_caps: Option<String>,
    #[arg(long)]
    pub drop_caps: Option<String>,
    #[arg(long)]
    pub allow_setuid: bool,
    #[arg(long)]
    pub keep_privs: bool,
    #[arg(long)]
    pub no_privs: bool,
    #[arg(long)]
    pub no_umask: bool,
    #[arg(long)]
    pub nv: bool,
    #[arg(long)]
    pub rocm: bool,
}

impl LaunchArgs {
    pub fn kind(&self) -> LauncherKind {
        if self.oci {
            LauncherKind::Oci
        } else {
            LauncherKind::Native
        }
    }

    pub fn into_options(self) -> Result<LaunchOptions, String> {
        let cgroups_json = match &self.apply_cgroups {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                format!(
                    "configuration error: failed to read {}: {e}",
                    path.display()
                )
            })?),
            None => None,
        };
        Ok(LaunchOptions {
            home: self.home,
            no_home: self.no_home,
            bind_paths: self.bind,
            env: self.env,
            env_file: self.env_file,
            devices: self.device,
            cdi_dirs: self.cdi_dirs,
            security: self.security,
            cgroups_json,
            namespaces: Namespaces {
                user: self.userns,
                uts: self.uts,
                pid: self.pid,
                ipc: self.ipc,
                net: self.net,
            },
            hostname: self.hostname,
            fakeroot: self.fakeroot,
            writable_tmpfs: self.writable_tmpfs,
            cwd: self.cwd,
            writable: self.writable,
            overlay_paths: self.overlay,
            boot: self.boot,
            app_name: self.app,
            network: self.network,
            dns: self.dns,
            add_caps: self.add_caps,
            drop_caps: self.drop_caps,
            allow_suid: self.allow_setuid,
            keep_privs: self.keep_privs,
            no_privs: self.no_privs,
            no_umask: self.no_umask,
            shell_path: self.shell,
            nvidia: self.nv,
            rocm: self.rocm,
        })
    }
}

#[derive(Debug)]
pub enum Request {
    Exec { image: PathBuf, command: Vec<String> },
    Run { image: PathBuf, args: Vec<String> },
    Shell { image: PathBuf },
}

pub fn run(settings: Settings, launch: LaunchArgs, request: Request) -> Result<u8, String> {
    let kind = launch.kind();
    let options = launch.into_options()?;
    let config = LaunchConfig::new(options, kind).map_err(|e| CoreError::from(e).to_string())?;

    let params = match request {
        Request::Exec { image, command } => ExecParams::exec(image, &command),
        Request::Run { image, args } => ExecParams::run(image, &args),
        Request::Shell { image } => ExecParams::shell(image, config.shell_path()),
    };

    let launcher = select_launcher(BundleAssembler::new(config, settings));
    debug!("using the {} launcher", launcher.name());
    let code = launcher.exec(&params).map_err(|e| e.to_string())?;
    Ok(exit_status(code))
}
