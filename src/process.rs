//! External process execution.
//!
//! Every tool the orchestrator drives (git, make, QEMU, xorriso, the section
//! tool, gdb) goes through [`Cmd`]. Commands are argument vectors; nothing is
//! ever handed to a shell. The working directory and any extra environment are
//! explicit parameters of the command, never ambient process state.
//!
//! Two ways to run a command:
//!
//! - [`Cmd::capture`] / [`Cmd::output`] never fail. A non-zero exit, or a
//!   program that could not be spawned at all, comes back as data and a
//!   `[FAIL]` line is written to stderr unless the command is
//!   [`Cmd::quiet`]. The caller decides what it means.
//! - [`Cmd::run`] is fail-fast: non-zero becomes [`Error::Process`].

use anyhow::Result;
use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::Error;

/// Exit code reported when the program is not on `PATH`.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when the program exists but could not be started.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Outcome of a command whose stderr was captured.
///
/// When `exit_code` is 0, `stderr` is not authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of a command whose stdout and stderr were both captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for external commands.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    error_msg: Option<String>,
    echo_failures: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            error_msg: None,
            echo_failures: true,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Run the child in `dir` instead of the orchestrator's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add a variable on top of the inherited environment.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Label used in `[FAIL]` lines and errors instead of the program name.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Skip the `[FAIL]` line; the caller reports the failure itself.
    pub fn quiet(mut self) -> Self {
        self.echo_failures = false;
        self
    }

    pub fn echoes_failures(&self) -> bool {
        self.echo_failures
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Human-readable command line, for logs and `--dry-run`.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn context(&self) -> String {
        self.error_msg
            .clone()
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run to completion with stdout inherited and stderr captured.
    pub fn capture(&self) -> ProcessResult {
        log::debug!("exec: {}", self.display());

        let result = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output();

        let result = match result {
            Ok(out) => ProcessResult {
                exit_code: exit_code(out.status),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            },
            Err(e) => ProcessResult {
                exit_code: spawn_failure_code(&e),
                stderr: format!("failed to start {}: {}", self.program.to_string_lossy(), e),
            },
        };

        if !result.success() && self.echo_failures {
            report_failure(&self.context(), &result.stderr);
        }
        result
    }

    /// Run to completion with both stdout and stderr captured.
    pub fn output(&self) -> ProcessOutput {
        log::debug!("exec: {}", self.display());

        let output = match self.command().stdin(Stdio::null()).output() {
            Ok(out) => ProcessOutput {
                exit_code: exit_code(out.status),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            },
            Err(e) => ProcessOutput {
                exit_code: spawn_failure_code(&e),
                stdout: String::new(),
                stderr: format!("failed to start {}: {}", self.program.to_string_lossy(), e),
            },
        };

        if !output.success() && self.echo_failures {
            report_failure(&self.context(), &output.stderr);
        }
        output
    }

    /// Run interactively with every stream inherited and return the exit code.
    pub fn status(&self) -> i32 {
        log::debug!("exec: {}", self.display());

        match self.command().status() {
            Ok(status) => exit_code(status),
            Err(e) => {
                if self.echo_failures {
                    report_failure(
                        &self.context(),
                        &format!("failed to start {}: {}", self.program.to_string_lossy(), e),
                    );
                }
                spawn_failure_code(&e)
            }
        }
    }

    /// Fail-fast variant of [`Cmd::capture`].
    pub fn run(&self) -> Result<ProcessResult> {
        let result = self.capture();
        if !result.success() {
            return Err(Error::Process {
                what: self.context(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(result)
    }
}

fn report_failure(context: &str, stderr: &str) {
    eprintln!("[FAIL] {}: {}", context, stderr.trim());
}

fn spawn_failure_code(e: &std::io::Error) -> i32 {
    if e.kind() == ErrorKind::NotFound {
        EXIT_NOT_FOUND
    } else {
        EXIT_NOT_EXECUTABLE
    }
}

/// Map an exit status to a shell-style code; signals become 128 + signo.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Locate `program` on `PATH`.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_capture_success() {
        let result = Cmd::new("true").capture();
        assert!(result.success());
    }

    #[test]
    fn test_capture_nonzero_returns_stderr() {
        let result = Cmd::new("sh")
            .args(["-c", "echo 'clone exploded' >&2; exit 3"])
            .capture();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "clone exploded");
    }

    #[test]
    fn test_missing_program_is_data_not_error() {
        let result = Cmd::new("definitely_not_a_real_command_12345").capture();
        assert_eq!(result.exit_code, EXIT_NOT_FOUND);
        assert!(result.stderr.contains("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_output_captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "printf relocs"]).output();
        assert!(out.success());
        assert_eq!(out.stdout, "relocs");
    }

    #[test]
    fn test_explicit_current_dir() {
        let dir = tempdir().unwrap();
        let out = Cmd::new("pwd").current_dir(dir.path()).output();
        assert!(out.success());
        let reported = PathBuf::from(out.stdout.trim()).canonicalize().unwrap();
        assert_eq!(reported, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_explicit_env() {
        let out = Cmd::new("sh")
            .args(["-c", "printf %s \"$CRESCENT_TEST_VAR\""])
            .env("CRESCENT_TEST_VAR", "pinned")
            .output();
        assert_eq!(out.stdout, "pinned");
    }

    #[test]
    fn test_run_fails_fast() {
        let err = Cmd::new("false").error_msg("build limine").run().unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Process { what, exit_code, .. }) => {
                assert_eq!(what, "build limine");
                assert_eq!(*exit_code, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Cmd::new("sh").args(["-c", "exit 5"]).status(), 5);
        assert_eq!(
            Cmd::new("definitely_not_a_real_command_12345").status(),
            EXIT_NOT_FOUND
        );
    }

    #[test]
    fn test_quiet_failure_is_still_data() {
        let cmd = Cmd::new("sh")
            .args(["-c", "echo 'no .text section' >&2; exit 1"])
            .quiet();
        assert!(!cmd.echoes_failures());
        assert!(Cmd::new("sh").echoes_failures());

        let out = cmd.output();
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stderr.trim(), "no .text section");
    }

    #[test]
    fn test_display_joins_args() {
        let cmd = Cmd::new("make").args(["-C", "limine"]);
        assert_eq!(cmd.display(), "make -C limine");
    }

    #[test]
    fn test_which() {
        assert!(which("sh").is_some());
        assert!(which("definitely_not_a_real_command_12345").is_none());
    }
}
