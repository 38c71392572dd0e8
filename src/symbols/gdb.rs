//! Attach GDB to a `--debug` launch with kernel symbols loaded.
//!
//! The generated init script defines a `crescent-load` command, then connects
//! to QEMU's gdbstub and runs it. That command asks this binary for the
//! relocation script (`crescent-run symbols --output <file>`) and sources the
//! result, so a failed load can be retried from the GDB prompt once the kernel
//! is rebuilt.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

pub const LOAD_COMMAND: &str = "crescent-load";

#[derive(Debug, Clone)]
pub struct GdbAttach {
    /// This binary, used by `crescent-load` to re-enter the symbol bridge.
    pub exe: PathBuf,
    pub root: PathBuf,
    pub kernel: PathBuf,
    pub tool: PathBuf,
    pub port: u16,
    pub gdb: String,
}

impl GdbAttach {
    /// Arguments `crescent-load` runs to regenerate the relocation script.
    ///
    /// `--root` is global, so it goes after the subcommand name.
    pub fn load_args(&self, symbols_out: &Path) -> Vec<OsString> {
        vec![
            self.exe.clone().into_os_string(),
            "symbols".into(),
            "--root".into(),
            self.root.clone().into_os_string(),
            "--kernel".into(),
            self.kernel.clone().into_os_string(),
            "--tool".into(),
            self.tool.clone().into_os_string(),
            "--output".into(),
            symbols_out.as_os_str().to_os_string(),
        ]
    }

    /// The init script, with the relocation script written to `symbols_out`.
    ///
    /// `crescent-load` is defined before connecting, so it is still available
    /// at the prompt when the remote target is not up.
    pub fn render_script(&self, symbols_out: &Path) -> String {
        let load = self
            .load_args(symbols_out)
            .iter()
            .map(|a| quote(a.as_os_str()))
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "set confirm off\n\
             define {cmd}\n  \
             shell {load}\n  \
             source {out}\n\
             end\n\
             document {cmd}\n\
             Load Crescent kernel sections at their runtime addresses.\n\
             end\n\
             target remote localhost:{port}\n\
             {cmd}\n",
            port = self.port,
            cmd = LOAD_COMMAND,
            load = load,
            out = symbols_out.display(),
        )
    }

    /// Write the init script and run GDB interactively on it.
    ///
    /// Returns GDB's exit code.
    pub fn run(&self) -> Result<i32> {
        let symbols_out = tempfile::Builder::new()
            .prefix("crescent-symbols-")
            .suffix(".gdb")
            .tempfile()
            .context("Failed to create symbol script file")?;
        let mut script = tempfile::Builder::new()
            .prefix("crescent-init-")
            .suffix(".gdb")
            .tempfile()
            .context("Failed to create GDB init script")?;

        script
            .write_all(self.render_script(symbols_out.path()).as_bytes())
            .context("Failed to write GDB init script")?;
        script.flush().context("Failed to write GDB init script")?;

        println!("Attaching {} to localhost:{}...", self.gdb, self.port);
        let code = self.command(script.path()).status();
        Ok(code)
    }

    pub fn command(&self, script: &Path) -> Cmd {
        Cmd::new(&self.gdb)
            .arg("-q")
            .arg("-x")
            .arg_path(script)
            .error_msg("gdb")
    }
}

/// Single-quote `s` for the shell GDB's `shell` command runs.
fn quote(s: &OsStr) -> String {
    format!("'{}'", s.to_string_lossy().replace('\'', r"'\''"))
}
