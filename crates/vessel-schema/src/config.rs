use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("not supported by the {launcher} launcher: {options}")]
    Unsupported {
        launcher: LauncherKind,
        options: String,
    },
    #[error("invalid cgroups JSON: {0}")]
    CgroupsJson(String),
    #[error("invalid bind path '{spec}': {reason}")]
    InvalidBind { spec: String, reason: String },
    #[error("invalid home specification '{0}', expected '<dest>' or '<src>:<dest>' with absolute paths")]
    InvalidHome(String),
    #[error("invalid environment variable '{0}', expected KEY=VALUE")]
    InvalidEnv(String),
    #[error("invalid working directory '{0}', must be an absolute path")]
    InvalidCwd(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid image configuration: {0}")]
    ImageConfig(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Bundle generation plus an external OCI runtime.
    Oci,
    /// Direct execution of the resolved process on the host.
    Native,
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LauncherKind::Oci => write!(f, "oci"),
            LauncherKind::Native => write!(f, "native"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Namespaces {
    pub user: bool,
    pub uts: bool,
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
}

impl Namespaces {
    fn any(self) -> bool {
        self.user || self.uts || self.pid || self.ipc || self.net
    }
}

/// Raw launch options as collected from the command line. Turned into a
/// [`LaunchConfig`] by [`LaunchConfig::new`], which rejects combinations the
/// selected launcher cannot honor.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub home: Option<String>,
    pub no_home: bool,
    pub bind_paths: Vec<String>,
    pub env: Vec<String>,
    pub env_file: Option<PathBuf>,
    pub devices: Vec<String>,
    pub cdi_dirs: Vec<PathBuf>,
    pub security: Vec<String>,
    pub cgroups_json: Option<String>,
    pub namespaces: Namespaces,
    pub hostname: Option<String>,
    pub fakeroot: bool,
    pub writable_tmpfs: bool,
    pub cwd: Option<String>,
    pub writable: bool,
    pub overlay_paths: Vec<String>,
    pub boot: bool,
    pub app_name: Option<String>,
    pub network: Option<String>,
    pub dns: Option<String>,
    pub add_caps: Option<String>,
    pub drop_caps: Option<String>,
    pub allow_suid: bool,
    pub keep_privs: bool,
    pub no_privs: bool,
    pub no_umask: bool,
    pub shell_path: Option<String>,
    pub nvidia: bool,
    pub rocm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeSpec {
    /// Bind the invoking user's home directory at the same path.
    Host,
    /// `--home <dest>` or `--home <src>:<dest>`.
    Custom {
        source: Option<String>,
        destination: String,
    },
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPath {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Validated, immutable launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    kind: LauncherKind,
    home: HomeSpec,
    binds: Vec<BindPath>,
    env: Vec<(String, String)>,
    env_file: Option<PathBuf>,
    devices: Vec<String>,
    cdi_dirs: Vec<PathBuf>,
    cgroups: Option<Map<String, Value>>,
    namespaces: Namespaces,
    hostname: Option<String>,
    fakeroot: bool,
    writable_tmpfs: bool,
    cwd: Option<String>,
    shell_path: Option<String>,
}

impl LaunchConfig {
    pub fn new(options: LaunchOptions, kind: LauncherKind) -> Result<Self, ConfigError> {
        let rejected = unsupported_options(&options, kind);
        if !rejected.is_empty() {
            return Err(ConfigError::Unsupported {
                launcher: kind,
                options: rejected.join(", "),
            });
        }

        let home = if options.no_home {
            HomeSpec::Disabled
        } else {
            match options.home.as_deref() {
                None | Some("") => HomeSpec::Host,
                Some(spec) => parse_home(spec)?,
            }
        };

        let mut binds = Vec::new();
        for entry in &options.bind_paths {
            for spec in entry.split(',').filter(|s| !s.is_empty()) {
                binds.push(parse_bind(spec)?);
            }
        }

        let env = options
            .env
            .iter()
            .map(|e| match e.split_once('=') {
                Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
                _ => Err(ConfigError::InvalidEnv(e.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cgroups = match options.cgroups_json.as_deref() {
            None | Some("") => None,
            Some(json) => match serde_json::from_str::<Value>(json) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => {
                    return Err(ConfigError::CgroupsJson(
                        "expected a JSON object of cgroup controllers".to_owned(),
                    ))
                }
                Err(e) => return Err(ConfigError::CgroupsJson(e.to_string())),
            },
        };

        if let Some(cwd) = &options.cwd {
            if !cwd.starts_with('/') {
                return Err(ConfigError::InvalidCwd(cwd.clone()));
            }
        }

        let mut namespaces = options.namespaces;
        // A hostname only makes sense in a private UTS namespace.
        if options.hostname.is_some() {
            namespaces.uts = true;
        }

        Ok(Self {
            kind,
            home,
            binds,
            env,
            env_file: options.env_file,
            devices: options.devices,
            cdi_dirs: options.cdi_dirs,
            cgroups,
            namespaces,
            hostname: options.hostname,
            fakeroot: options.fakeroot,
            writable_tmpfs: options.writable_tmpfs,
            cwd: options.cwd,
            shell_path: options.shell_path,
        })
    }

    pub fn kind(&self) -> LauncherKind {
        self.kind
    }

    pub fn home(&self) -> &HomeSpec {
        &self.home
    }

    pub fn binds(&self) -> &[BindPath] {
        &self.binds
    }

    /// Explicit `--env` overrides in the order given.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn env_file(&self) -> Option<&PathBuf> {
        self.env_file.as_ref()
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn cdi_dirs(&self) -> &[PathBuf] {
        &self.cdi_dirs
    }

    pub fn cgroups(&self) -> Option<&Map<String, Value>> {
        self.cgroups.as_ref()
    }

    pub fn namespaces(&self) -> Namespaces {
        self.namespaces
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn fakeroot(&self) -> bool {
        self.fakeroot
    }

    pub fn writable_tmpfs(&self) -> bool {
        self.writable_tmpfs
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn shell_path(&self) -> Option<&str> {
        self.shell_path.as_deref()
    }
}

fn unsupported_options(o: &LaunchOptions, kind: LauncherKind) -> Vec<&'static str> {
    let mut rejected = Vec::new();
    let mut check = |set: bool, name: &'static str| {
        if set {
            rejected.push(name);
        }
    };

    check(!o.security.is_empty(), "--security");
    check(o.writable, "--writable");
    check(!o.overlay_paths.is_empty(), "--overlay");
    check(o.boot, "--boot");
    check(o.app_name.is_some(), "--app");
    check(o.network.is_some(), "--network");
    check(o.dns.is_some(), "--dns");
    check(o.add_caps.is_some(), "--add-caps");
    check(o.drop_caps.is_some(), "--drop-caps");
    check(o.allow_suid, "--allow-setuid");
    check(o.keep_privs, "--keep-privs");
    check(o.no_privs, "--no-privs");
    check(o.no_umask, "--no-umask");
    check(o.nvidia, "--nv");
    check(o.rocm, "--rocm");

    match kind {
        LauncherKind::Oci => check(o.shell_path.is_some(), "--shell"),
        LauncherKind::Native => {
            check(o.fakeroot, "--fakeroot");
            check(!o.devices.is_empty(), "--device");
            check(!o.cdi_dirs.is_empty(), "--cdi-dirs");
            check(o.cgroups_json.is_some(), "--apply-cgroups");
            check(o.namespaces.any(), "namespace flags");
            check(o.hostname.is_some(), "--hostname");
        }
    }

    rejected
}

fn parse_home(spec: &str) -> Result<HomeSpec, ConfigError> {
    let (source, destination) = match spec.split_once(':') {
        Some((src, dest)) => (Some(src), dest),
        None => (None, spec),
    };
    let valid = destination.starts_with('/') && source.map_or(true, |s| s.starts_with('/'));
    if !valid {
        return Err(ConfigError::InvalidHome(spec.to_owned()));
    }
    Ok(HomeSpec::Custom {
        source: source.map(str::to_owned),
        destination: destination.to_owned(),
    })
}

fn parse_bind(spec: &str) -> Result<BindPath, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBind {
        spec: spec.to_owned(),
        reason: reason.to_owned(),
    };

    let mut parts = spec.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let destination = parts.next().filter(|d| !d.is_empty()).unwrap_or(source);
    let read_only = match parts.next() {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => return Err(invalid(&format!("unknown bind option '{other}'"))),
    };

    if !source.starts_with('/') {
        return Err(invalid("source must be an absolute path"));
    }
    if !destination.starts_with('/') {
        return Err(invalid("destination must be an absolute path"));
    }

    Ok(BindPath {
        source: source.to_owned(),
        destination: destination.to_owned(),
        read_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid_for_both_launchers() {
        let oci = LaunchConfig::new(LaunchOptions::default(), LauncherKind::Oci).unwrap();
        assert_eq!(oci.home(), &HomeSpec::Host);
        assert!(oci.binds().is_empty());
        assert!(LaunchConfig::new(LaunchOptions::default(), LauncherKind::Native).is_ok());
    }

    #[test]
    fn security_option_is_rejected_by_oci_launcher() {
        let opts = LaunchOptions {
            security: vec!["seccomp:example.json".to_owned()],
            ..LaunchOptions::default()
        };
        let err = LaunchConfig::new(opts, LauncherKind::Oci).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("oci launcher"));
        assert!(msg.contains("--security"));
    }

    #[test]
    fn native_launcher_rejects_runtime_only_options() {
        let opts = LaunchOptions {
            fakeroot: true,
            devices: vec!["vendor.com/gpu=0".to_owned()],
            ..LaunchOptions::default()
        };
        let err = LaunchConfig::new(opts, LauncherKind::Native).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--fakeroot"));
        assert!(msg.contains("--device"));
    }

    #[test]
    fn shell_path_only_for_native() {
        let opts = LaunchOptions {
            shell_path: Some("/bin/zsh".to_owned()),
            ..LaunchOptions::default()
        };
        assert!(LaunchConfig::new(opts.clone(), LauncherKind::Oci).is_err());
        let cfg = LaunchConfig::new(opts, LauncherKind::Native).unwrap();
        assert_eq!(cfg.shell_path(), Some("/bin/zsh"));
    }

    #[test]
    fn home_specs() {
        let parse = |home: &str| {
            LaunchConfig::new(
                LaunchOptions {
                    home: Some(home.to_owned()),
                    ..LaunchOptions::default()
                },
                LauncherKind::Oci,
            )
        };
        assert_eq!(
            parse("/home/dest").unwrap().home(),
            &HomeSpec::Custom {
                source: None,
                destination: "/home/dest".to_owned()
            }
        );
        assert_eq!(
            parse("/home/src:/home/dest").unwrap().home(),
            &HomeSpec::Custom {
                source: Some("/home/src".to_owned()),
                destination: "/home/dest".to_owned()
            }
        );
        assert!(parse("relative").is_err());
    }

    #[test]
    fn no_home_wins_over_home() {
        let cfg = LaunchConfig::new(
            LaunchOptions {
                home: Some("/home/dest".to_owned()),
                no_home: true,
                ..LaunchOptions::default()
            },
            LauncherKind::Oci,
        )
        .unwrap();
        assert_eq!(cfg.home(), &HomeSpec::Disabled);
    }

    #[test]
    fn bind_paths_are_split_and_parsed() {
        let cfg = LaunchConfig::new(
            LaunchOptions {
                bind_paths: vec!["/data,/src:/mnt/src:ro".to_owned(), "/opt:/opt:rw".to_owned()],
                ..LaunchOptions::default()
            },
            LauncherKind::Oci,
        )
        .unwrap();
        let binds = cfg.binds();
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0].destination, "/data");
        assert!(binds[1].read_only);
        assert_eq!(binds[1].destination, "/mnt/src");
        assert!(!binds[2].read_only);
    }

    #[test]
    fn bad_bind_paths_fail() {
        for spec in ["relative:/x", "/x:relative", "/x:/y:bogus"] {
            let res = LaunchConfig::new(
                LaunchOptions {
                    bind_paths: vec![spec.to_owned()],
                    ..LaunchOptions::default()
                },
                LauncherKind::Oci,
            );
            assert!(res.is_err(), "{spec} should be rejected");
        }
    }

    #[test]
    fn env_entries_must_have_a_key() {
        let ok = LaunchConfig::new(
            LaunchOptions {
                env: vec!["A=1".to_owned(), "B=x=y".to_owned(), "C=".to_owned()],
                ..LaunchOptions::default()
            },
            LauncherKind::Oci,
        )
        .unwrap();
        assert_eq!(ok.env()[1], ("B".to_owned(), "x=y".to_owned()));
        assert_eq!(ok.env()[2], ("C".to_owned(), String::new()));

        for bad in ["NOEQUALS", "=value"] {
            let res = LaunchConfig::new(
                LaunchOptions {
                    env: vec![bad.to_owned()],
                    ..LaunchOptions::default()
                },
                LauncherKind::Oci,
            );
            assert!(matches!(res, Err(ConfigError::InvalidEnv(_))));
        }
    }

    #[test]
    fn cgroups_json_must_be_an_object() {
        let parse = |json: &str| {
            LaunchConfig::new(
                LaunchOptions {
                    cgroups_json: Some(json.to_owned()),
                    ..LaunchOptions::default()
                },
                LauncherKind::Oci,
            )
        };
        let cfg = parse(r#"{"memory":{"limit":1024}}"#).unwrap();
        assert!(cfg.cgroups().unwrap().contains_key("memory"));
        assert!(parse("[1,2]").is_err());
        assert!(parse("{broken").is_err());
    }

    #[test]
    fn hostname_implies_uts_namespace() {
        let cfg = LaunchConfig::new(
            LaunchOptions {
                hostname: Some("box".to_owned()),
                ..LaunchOptions::default()
            },
            LauncherKind::Oci,
        )
        .unwrap();
        assert!(cfg.namespaces().uts);
        assert_eq!(cfg.hostname(), Some("box"));
    }

    #[test]
    fn relative_cwd_is_rejected() {
        let res = LaunchConfig::new(
            LaunchOptions {
                cwd: Some("work".to_owned()),
                ..LaunchOptions::default()
            },
            LauncherKind::Oci,
        );
        assert!(matches!(res, Err(ConfigError::InvalidCwd(_))));
    }
}
