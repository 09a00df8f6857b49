use crate::concurrency::shutdown_flag;
use crate::env::{env_file_map, EnvironmentMap};
use crate::RuntimeError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Evaluates env-file content and reports the resulting variables as
/// `KEY=VALUE` strings.
pub trait EnvEvaluator {
    fn evaluate(&self, content: &str) -> Result<Vec<String>, RuntimeError>;
}

/// Runs env-file content through a POSIX shell with an empty environment and
/// every assignment exported.
pub struct ShellEvaluator {
    shell: PathBuf,
    cancel: &'static AtomicBool,
    poll_interval: Duration,
}

impl Default for ShellEvaluator {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl ShellEvaluator {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            cancel: shutdown_flag(),
            poll_interval: Duration::from_millis(20),
        }
    }

    /// Poll `flag` instead of the process-wide shutdown flag.
    pub fn with_cancel_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.cancel = flag;
        self
    }
}

// Shell bookkeeping variables that never come from the file itself.
const SHELL_NOISE: [&str; 3] = ["SHLVL", "_", "OLDPWD"];

impl EnvEvaluator for ShellEvaluator {
    fn evaluate(&self, content: &str) -> Result<Vec<String>, RuntimeError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(RuntimeError::Cancelled);
        }

        // `command -p` finds env on the default path, whatever PATH the file set.
        let script = format!("set -a\n{content}\nset +a\ncommand -p env -0\n");
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RuntimeError::ShellEval(format!("failed to start {}: {e}", self.shell.display()))
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::ShellEval("shell stdout unavailable".to_owned()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::ShellEval("shell stderr unavailable".to_owned()))?;
        let out_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });
        let err_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        });

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if self.cancel.load(Ordering::SeqCst) {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!("environment file evaluation cancelled");
                return Err(RuntimeError::Cancelled);
            }
            std::thread::sleep(self.poll_interval);
        };

        let out = out_reader.join().unwrap_or_default();
        let err = err_reader.join().unwrap_or_default();

        if !status.success() {
            let reason = err.trim();
            return Err(RuntimeError::ShellEval(if reason.is_empty() {
                format!("shell exited with {status}")
            } else {
                reason.to_owned()
            }));
        }

        Ok(String::from_utf8_lossy(&out)
            .split('\0')
            .filter(|entry| match entry.split_once('=') {
                Some((k, _)) => !k.is_empty() && !SHELL_NOISE.contains(&k),
                None => false,
            })
            .map(str::to_owned)
            .collect())
    }
}

/// Read and evaluate an env-file, returning the variables allowed into the
/// container.
pub fn env_file_vars(
    path: &Path,
    evaluator: &dyn EnvEvaluator,
) -> Result<EnvironmentMap, RuntimeError> {
    let content = std::fs::read_to_string(path).map_err(|e| RuntimeError::EnvFileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let lines = evaluator.evaluate(&content).map_err(|e| match e {
        RuntimeError::Cancelled => RuntimeError::Cancelled,
        other => RuntimeError::EnvFileEval {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    })?;
    Ok(env_file_map(&lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<String>);

    impl EnvEvaluator for Fixed {
        fn evaluate(&self, _content: &str) -> Result<Vec<String>, RuntimeError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn shell_evaluates_assignments() {
        let vars = ShellEvaluator::default()
            .evaluate("FOO=bar\nBAZ=\"two words\"\nQUX=$FOO-x")
            .unwrap();
        assert!(vars.contains(&"FOO=bar".to_owned()));
        assert!(vars.contains(&"BAZ=two words".to_owned()));
        assert!(vars.contains(&"QUX=bar-x".to_owned()));
        assert!(!vars.iter().any(|v| v.starts_with("SHLVL=") || v.starts_with("_=")));
    }

    #[test]
    fn file_can_set_path() {
        let vars = ShellEvaluator::default()
            .evaluate("PATH=/opt/tools/bin\nFOO=1")
            .unwrap();
        assert!(vars.contains(&"PATH=/opt/tools/bin".to_owned()));
        assert!(vars.contains(&"FOO=1".to_owned()));
    }

    #[test]
    fn shell_does_not_leak_host_environment() {
        let vars = ShellEvaluator::default().evaluate("A=1").unwrap();
        assert!(vars.contains(&"A=1".to_owned()));
        assert!(!vars.iter().any(|v| v.starts_with("CARGO_MANIFEST_DIR=")));
    }

    #[test]
    fn shell_syntax_error_fails() {
        let err = ShellEvaluator::default().evaluate("if then fi (").unwrap_err();
        assert!(matches!(err, RuntimeError::ShellEval(_)));
    }

    #[test]
    fn cancelled_before_start() {
        static CANCELLED: AtomicBool = AtomicBool::new(true);
        let err = ShellEvaluator::default()
            .with_cancel_flag(&CANCELLED)
            .evaluate("A=1")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
    }

    #[test]
    fn cancelled_while_running() {
        static CANCEL: AtomicBool = AtomicBool::new(false);
        let handle = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(100));
            CANCEL.store(true, Ordering::SeqCst);
        });
        let err = ShellEvaluator::default()
            .with_cancel_flag(&CANCEL)
            .evaluate("sleep 30")
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, RuntimeError::Cancelled));
    }

    #[test]
    fn env_file_vars_applies_blocklist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env");
        std::fs::write(&path, "ignored by the fixed evaluator").unwrap();
        let eval = Fixed(vec!["HOME=/x".to_owned(), "KEEP=yes".to_owned()]);
        let env = env_file_vars(&path, &eval).unwrap();
        assert_eq!(env.get("KEEP"), Some("yes"));
        assert_eq!(env.get("HOME"), None);
    }

    #[test]
    fn missing_env_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = env_file_vars(&dir.path().join("nope"), &Fixed(Vec::new())).unwrap_err();
        assert!(matches!(err, RuntimeError::EnvFileRead { .. }));
    }

    #[test]
    fn evaluation_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.env");
        std::fs::write(&path, "if then (").unwrap();
        let err = env_file_vars(&path, &ShellEvaluator::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::EnvFileEval { .. }));
        assert!(err.to_string().contains("broken.env"));
    }
}
