//! Symbol bridge between the section tool and a debug session.
//!
//! The kernel runs at a higher-half address that differs from the link
//! layout, so GDB needs `add-symbol-file` commands placing each section. The
//! external section tool computes them from the built kernel:
//!
//! ```text
//! tools/sections/sections <kernel>
//! add-symbol-file <kernel> -s .text 0xffffffff80001000 -s .data 0x... ...
//! ```
//!
//! [`SymbolBridge::load`] runs the tool once and hands its output to a
//! [`DebugSession`] in a single call. A failed tool run submits nothing.

pub mod gdb;

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::process::Cmd;

/// The debugger side of a symbol load.
pub trait DebugSession {
    /// Submit a block of debugger commands.
    fn execute(&mut self, commands: &str) -> Result<()>;

    /// Show a message to the user.
    fn write(&mut self, text: &str);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Idle,
    Querying,
    Loaded,
    Failed,
}

#[derive(Debug)]
pub struct SymbolBridge {
    tool: PathBuf,
    kernel: PathBuf,
    state: LoadState,
}

impl SymbolBridge {
    pub fn new(tool: impl Into<PathBuf>, kernel: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            kernel: kernel.into(),
            state: LoadState::Idle,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// `<tool> <kernel>`
    ///
    /// Quiet: a failure is reported once, through the session.
    pub fn query_cmd(&self) -> Cmd {
        Cmd::new(&self.tool)
            .arg_path(&self.kernel)
            .error_msg("section tool")
            .quiet()
    }

    /// Query the section tool and submit its relocation commands.
    pub fn load(&mut self, session: &mut dyn DebugSession) -> Result<()> {
        self.state = LoadState::Querying;
        let out = self.query_cmd().output();

        if !out.success() {
            let stderr = out.stderr.trim();
            session.write(&format!("Failed to load! stderr: {}", stderr));
            self.state = LoadState::Failed;
            return Err(Error::SymbolLoad(stderr.to_string()).into());
        }

        let relocations = out.stdout.trim();
        log::debug!("relocation script: {}", relocations);
        match session.execute(relocations) {
            Ok(()) => {
                self.state = LoadState::Loaded;
                Ok(())
            }
            Err(e) => {
                self.state = LoadState::Failed;
                Err(e)
            }
        }
    }
}

/// Collects submitted commands into a script GDB can `source`.
#[derive(Debug, Default)]
pub struct ScriptSession {
    commands: Vec<String>,
}

impl ScriptSession {
    pub fn script(&self) -> String {
        let mut script = String::new();
        for block in &self.commands {
            script.push_str(block);
            script.push('\n');
        }
        script
    }
}

impl DebugSession for ScriptSession {
    fn execute(&mut self, commands: &str) -> Result<()> {
        self.commands.push(commands.to_string());
        Ok(())
    }

    fn write(&mut self, text: &str) {
        eprintln!("{}", text);
    }
}

/// Load symbols and write the resulting script to `output`, or stdout.
///
/// A failed load still writes `output`, empty, so a `source` of it is a no-op.
pub fn emit(bridge: &mut SymbolBridge, output: Option<&Path>) -> Result<()> {
    let mut session = ScriptSession::default();
    let result = bridge.load(&mut session);
    let script = session.script();

    match output {
        Some(path) => fs::write(path, &script)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(script.as_bytes())
                .and_then(|()| stdout.flush())
                .context("Failed to write relocation script")?;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSession {
        executed: Vec<String>,
        written: Vec<String>,
    }

    impl DebugSession for RecordingSession {
        fn execute(&mut self, commands: &str) -> Result<()> {
            self.executed.push(commands.to_string());
            Ok(())
        }

        fn write(&mut self, text: &str) {
            self.written.push(text.to_string());
        }
    }

    fn tool_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sections");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_query_cmd_passes_kernel_only() {
        let bridge = SymbolBridge::new("./tools/sections/sections", "./crescent-kernel");
        assert_eq!(
            bridge.query_cmd().display(),
            "./tools/sections/sections ./crescent-kernel"
        );
        assert!(!bridge.query_cmd().echoes_failures());
    }

    #[test]
    fn test_successful_load_executes_once() {
        let dir = tempdir().unwrap();
        let tool = tool_script(
            dir.path(),
            "echo \"add-symbol-file $1 -s .text 0xffffffff80001000\"\necho",
        );
        let mut bridge = SymbolBridge::new(&tool, "./crescent-kernel");
        let mut session = RecordingSession::default();

        bridge.load(&mut session).unwrap();

        assert_eq!(
            session.executed,
            ["add-symbol-file ./crescent-kernel -s .text 0xffffffff80001000"]
        );
        assert!(session.written.is_empty());
        assert_eq!(bridge.state(), LoadState::Loaded);
    }

    #[test]
    fn test_failed_tool_submits_nothing() {
        let dir = tempdir().unwrap();
        let tool = tool_script(dir.path(), "echo 'no .text section' >&2\nexit 1");
        let mut bridge = SymbolBridge::new(&tool, "./crescent-kernel");
        let mut session = RecordingSession::default();

        let err = bridge.load(&mut session).unwrap_err();

        assert!(session.executed.is_empty());
        assert_eq!(session.written, ["Failed to load! stderr: no .text section"]);
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::SymbolLoad(_))));
        assert_eq!(bridge.state(), LoadState::Failed);
    }

    #[test]
    fn test_missing_tool_is_a_failed_load() {
        let mut bridge = SymbolBridge::new("/nonexistent/sections", "./crescent-kernel");
        let mut session = RecordingSession::default();

        assert!(bridge.load(&mut session).is_err());
        assert!(session.executed.is_empty());
        assert_eq!(session.written.len(), 1);
        assert!(session.written[0].starts_with("Failed to load! stderr: "));
    }

    #[test]
    fn test_emit_truncates_output_on_failure() {
        let dir = tempdir().unwrap();
        let tool = tool_script(dir.path(), "exit 2");
        let output = dir.path().join("symbols.gdb");
        fs::write(&output, "add-symbol-file stale\n").unwrap();

        let mut bridge = SymbolBridge::new(&tool, "./crescent-kernel");
        assert!(emit(&mut bridge, Some(&output)).is_err());
        assert_eq!(fs::read_to_string(&output).unwrap(), "");
    }

    #[test]
    fn test_emit_writes_script() {
        let dir = tempdir().unwrap();
        let tool = tool_script(dir.path(), "echo 'add-symbol-file k -s .data 0x1'");
        let output = dir.path().join("symbols.gdb");

        let mut bridge = SymbolBridge::new(&tool, "k");
        emit(&mut bridge, Some(&output)).unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "add-symbol-file k -s .data 0x1\n"
        );
    }
}
