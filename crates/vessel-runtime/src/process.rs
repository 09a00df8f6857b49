use crate::RuntimeError;
use std::io::IsTerminal;
use std::path::PathBuf;
use vessel_schema::{ImageConfig, Process, User};

/// Where the invoking user's identity comes from.
pub trait IdentitySource {
    fn uid(&self) -> u32;
    fn gid(&self) -> u32;
    fn username(&self) -> Result<String, RuntimeError>;
    fn home_dir(&self) -> Result<PathBuf, RuntimeError>;
}

/// The real user of this process, resolved through the passwd database.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIdentity;

impl HostIdentity {
    fn passwd_entry(self) -> Result<uzers::User, RuntimeError> {
        let uid = uzers::get_current_uid();
        uzers::get_user_by_uid(uid)
            .ok_or_else(|| RuntimeError::Identity(format!("no passwd entry for uid {uid}")))
    }
}

impl IdentitySource for HostIdentity {
    fn uid(&self) -> u32 {
        uzers::get_current_uid()
    }

    fn gid(&self) -> u32 {
        uzers::get_current_gid()
    }

    fn username(&self) -> Result<String, RuntimeError> {
        Ok(self.passwd_entry()?.name().to_string_lossy().into_owned())
    }

    fn home_dir(&self) -> Result<PathBuf, RuntimeError> {
        use uzers::os::unix::UserExt;
        Ok(self.passwd_entry()?.home_dir().to_path_buf())
    }
}

/// A fixed identity, for callers that already know who they run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub home: PathBuf,
}

impl IdentitySource for StaticIdentity {
    fn uid(&self) -> u32 {
        self.uid
    }

    fn gid(&self) -> u32 {
        self.gid
    }

    fn username(&self) -> Result<String, RuntimeError> {
        Ok(self.name.clone())
    }

    fn home_dir(&self) -> Result<PathBuf, RuntimeError> {
        Ok(self.home.clone())
    }
}

/// Container argv. An explicit `process` replaces the image entrypoint;
/// non-empty `args` replace the image cmd, which is dropped entirely when a
/// process is given.
pub fn process_args(image: &ImageConfig, process: Option<&str>, args: &[String]) -> Vec<String> {
    let process = process.filter(|p| !p.is_empty());
    let mut argv = match process {
        Some(p) => vec![p.to_owned()],
        None => image.entrypoint().to_vec(),
    };
    if !args.is_empty() {
        argv.extend_from_slice(args);
    } else if process.is_none() {
        argv.extend_from_slice(image.cmd());
    }
    argv
}

pub fn process_user(fakeroot: bool, identity: &dyn IdentitySource) -> User {
    if fakeroot {
        User::default()
    } else {
        User {
            uid: identity.uid(),
            gid: identity.gid(),
            additional_gids: Vec::new(),
        }
    }
}

pub fn process_cwd(
    fakeroot: bool,
    cwd: Option<&str>,
    identity: &dyn IdentitySource,
) -> Result<String, RuntimeError> {
    if let Some(cwd) = cwd.filter(|c| !c.is_empty()) {
        return Ok(cwd.to_owned());
    }
    if fakeroot {
        return Ok("/root".to_owned());
    }
    Ok(identity.home_dir()?.to_string_lossy().into_owned())
}

pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

/// Assembles the container [`Process`] from image metadata, the caller's
/// identity and an already resolved environment.
pub struct ProcessBuilder<'a> {
    image: &'a ImageConfig,
    identity: &'a dyn IdentitySource,
    process: Option<String>,
    args: Vec<String>,
    env: Vec<String>,
    fakeroot: bool,
    cwd: Option<String>,
    terminal: Option<bool>,
}

impl<'a> ProcessBuilder<'a> {
    pub fn new(image: &'a ImageConfig, identity: &'a dyn IdentitySource) -> Self {
        Self {
            image,
            identity,
            process: None,
            args: Vec::new(),
            env: Vec::new(),
            fakeroot: false,
            cwd: None,
            terminal: None,
        }
    }

    #[must_use]
    pub fn process(mut self, process: Option<&str>) -> Self {
        self.process = process.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn args(mut self, args: &[String]) -> Self {
        self.args = args.to_vec();
        self
    }

    #[must_use]
    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn fakeroot(mut self, fakeroot: bool) -> Self {
        self.fakeroot = fakeroot;
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: Option<&str>) -> Self {
        self.cwd = cwd.map(str::to_owned);
        self
    }

    /// Force the terminal flag instead of probing stdin.
    #[must_use]
    pub fn terminal(mut self, terminal: bool) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn build(&self) -> Result<Process, RuntimeError> {
        let cwd = process_cwd(self.fakeroot, self.cwd.as_deref(), self.identity)?;
        let process = Process {
            terminal: self.terminal.unwrap_or_else(stdin_is_terminal),
            user: process_user(self.fakeroot, self.identity),
            args: process_args(self.image, self.process.as_deref(), &self.args),
            env: self.env.clone(),
            cwd,
        };
        tracing::debug!(
            "container process: args={:?} uid={} gid={} cwd={}",
            process.args,
            process.user.uid,
            process.user.gid,
            process.cwd
        );
        Ok(process)
    }
}
