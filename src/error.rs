//! Error conditions the CLI has to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached. These
//! variants exist so `main` can pick an exit code by downcasting.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The bootable medium does not exist and setup was not requested.
    #[error("bootable medium not found at {}. Run with --setup, then package the image", .0.display())]
    MissingMedium(PathBuf),

    /// A fail-fast external command exited non-zero.
    #[error("{what} failed (exit code {exit_code}): {stderr}")]
    Process {
        what: String,
        exit_code: i32,
        stderr: String,
    },

    /// Fresh setup refuses to touch an existing image tree.
    #[error("image tree already exists at {} (fresh setup mode)", .0.display())]
    TreeExists(PathBuf),

    /// The image tree is missing files required to boot.
    #[error("image tree is incomplete, missing:\n  {}", display_paths(.0))]
    IncompleteTree(Vec<PathBuf>),

    #[error("invalid memory size '{0}': expected digits with an optional K/M/G/T suffix")]
    InvalidMemorySize(String),

    /// The section tool failed; nothing was submitted to the debug session.
    #[error("symbol load failed: {0}")]
    SymbolLoad(String),

    /// Strict setup stopped at a failed stage.
    #[error("setup failed at stage '{0}'")]
    SetupFailed(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n  ")
}
