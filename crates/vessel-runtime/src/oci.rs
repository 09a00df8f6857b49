use crate::RuntimeError;
use serde::Deserialize;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Runtimes probed, in order, when none is configured.
pub const RUNTIME_CANDIDATES: [&str; 3] = ["crun", "runc", "youki"];

/// Handle on an external OCI runtime executable.
///
/// Every invocation has the shape
/// `[wrapper...] <program> --root <root> <verb> [options] <id> [trailing]`.
#[derive(Debug, Clone)]
pub struct OciRuntime {
    program: String,
    root: PathBuf,
    wrapper: Vec<String>,
}

/// The runtime's `state` output.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    #[serde(default)]
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub bundle: String,
}

impl OciRuntime {
    pub fn new(program: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            root: root.into(),
            wrapper: Vec::new(),
        }
    }

    /// Use `configured` if given, otherwise the first available candidate.
    pub fn detect(
        configured: Option<&str>,
        root: impl Into<PathBuf>,
    ) -> Result<Self, RuntimeError> {
        let program = match configured {
            Some(p) if !p.is_empty() => p.to_owned(),
            _ => Self::find_runtime().ok_or(RuntimeError::RuntimeNotFound)?,
        };
        Ok(Self::new(program, root))
    }

    pub fn find_runtime() -> Option<String> {
        for candidate in RUNTIME_CANDIDATES {
            if let Ok(output) = Command::new(candidate).arg("--version").output() {
                if output.status.success() {
                    return Some(candidate.to_owned());
                }
            }
        }
        None
    }

    /// Run the runtime through `wrapper`, e.g. a user-namespace helper.
    #[must_use]
    pub fn with_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn command_line(
        &self,
        verb: &str,
        options: &[&str],
        id: &str,
        trailing: &[&str],
    ) -> Vec<String> {
        let mut argv = self.wrapper.clone();
        argv.push(self.program.clone());
        argv.push("--root".to_owned());
        argv.push(self.root.to_string_lossy().into_owned());
        argv.push(verb.to_owned());
        argv.extend(options.iter().map(|s| (*s).to_owned()));
        argv.push(id.to_owned());
        argv.extend(trailing.iter().map(|s| (*s).to_owned()));
        argv
    }

    fn command(argv: &[String]) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }

    fn spawn_error(verb: &str, argv: &[String], source: std::io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            verb: verb.to_owned(),
            program: argv[0].clone(),
            source,
        }
    }

    /// Run with stdout inherited and stderr captured, echoed, and its last
    /// line attached to any failure.
    fn invoke(
        &self,
        verb: &str,
        options: &[&str],
        id: &str,
        trailing: &[&str],
    ) -> Result<(), RuntimeError> {
        let argv = self.command_line(verb, options, id, trailing);
        debug!("running {}", argv.join(" "));
        let output = Self::command(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Self::spawn_error(verb, &argv, e))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            eprint!("{stderr}");
        }
        check_status(verb, id, output.status, &stderr)
    }

    /// `create --bundle <bundle> <id>`. All stdio is inherited: the container
    /// init keeps the runtime's descriptors open until it exits.
    pub fn create(&self, id: &str, bundle: &Path) -> Result<(), RuntimeError> {
        let bundle = bundle.to_string_lossy().into_owned();
        let argv = self.command_line("create", &["--bundle", bundle.as_str()], id, &[]);
        debug!("running {}", argv.join(" "));
        let status = Self::command(&argv)
            .status()
            .map_err(|e| Self::spawn_error("create", &argv, e))?;
        check_status("create", id, status, "")
    }

    pub fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.invoke("start", &[], id, &[])
    }

    pub fn kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        self.invoke("kill", &[], id, &[signal])
    }

    pub fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        self.invoke("delete", &[], id, &[])
    }

    pub fn state(&self, id: &str) -> Result<RuntimeState, RuntimeError> {
        let argv = self.command_line("state", &[], id, &[]);
        debug!("running {}", argv.join(" "));
        let output = Self::command(&argv)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Self::spawn_error("state", &argv, e))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            eprint!("{stderr}");
        }
        check_status("state", id, output.status, &stderr)?;
        serde_json::from_slice(&output.stdout).map_err(|e| RuntimeError::StateParse {
            id: id.to_owned(),
            reason: e.to_string(),
        })
    }

    /// `run --bundle <bundle> <id>` in the foreground with stdio inherited.
    /// Returns the container's exit code.
    pub fn run(&self, id: &str, bundle: &Path) -> Result<i32, RuntimeError> {
        let bundle = bundle.to_string_lossy().into_owned();
        let argv = self.command_line("run", &["--bundle", bundle.as_str()], id, &[]);
        debug!("running {}", argv.join(" "));
        let status = Self::command(&argv)
            .status()
            .map_err(|e| Self::spawn_error("run", &argv, e))?;
        Ok(exit_code(status))
    }
}

/// Exit code as a shell reports it: signals map to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

fn check_status(
    verb: &str,
    id: &str,
    status: ExitStatus,
    stderr: &str,
) -> Result<(), RuntimeError> {
    if status.success() {
        return Ok(());
    }
    let last_line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_owned();
    Err(RuntimeError::CommandFailed {
        verb: verb.to_owned(),
        id: id.to_owned(),
        code: exit_code(status),
        stderr: last_line,
    })
}
