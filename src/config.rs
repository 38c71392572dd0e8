//! Test environment configuration.
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. built-in [`defaults`]
//! 2. `crescent-run.toml` in the project root (or an explicit `--config` file)
//! 3. environment overrides (`CRESCENT_OVMF_PATH`, `CRESCENT_QEMU`,
//!    `CRESCENT_LIMINE_BRANCH`)
//! 4. command-line flags, applied by the CLI on top of [`Project`]
//!
//! # Example
//!
//! ```rust
//! use crescent_run::config::Config;
//!
//! let config = Config::from_toml_str("[launch]\nmemory = \"512M\"\n").unwrap();
//! assert_eq!(config.launch.memory, "512M");
//! assert_eq!(config.launch.cpus, 2);
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::fetch::{BootloaderSource, FailurePolicy};
use crate::image::{ImageTree, SetupMode, StrategyKind};

pub const CONFIG_FILENAME: &str = "crescent-run.toml";

pub const OVMF_PATH_ENV: &str = "CRESCENT_OVMF_PATH";
pub const QEMU_ENV: &str = "CRESCENT_QEMU";
pub const LIMINE_BRANCH_ENV: &str = "CRESCENT_LIMINE_BRANCH";

/// Built-in defaults. Relative paths are relative to the project root.
pub mod defaults {
    pub const TESTING_DIR: &str = "TESTING";
    pub const ISO: &str = "TESTING/crescent.iso";
    pub const KERNEL: &str = "crescent-kernel";
    pub const SECTIONS_TOOL: &str = "tools/sections/sections";
    pub const LIMINE_TEMPLATE: &str = "limine.conf";

    pub const QEMU: &str = "qemu-system-x86_64";
    pub const CPUS: u32 = 2;
    pub const MEMORY: &str = "128M";
    pub const FIRMWARE_DIR: &str = "/usr/share/edk2/x64";
    pub const GDB_PORT: u16 = 1234;

    pub const LIMINE_URL: &str = "https://github.com/limine-bootloader/limine.git";
    pub const LIMINE_BRANCH: &str = "v8.x-binary";
    pub const CLONE_DEPTH: u32 = 1;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub launch: LaunchConfig,
    pub setup: SetupConfig,
    pub bootloader: BootloaderConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub testing_dir: PathBuf,
    pub iso: PathBuf,
    pub kernel: PathBuf,
    pub sections_tool: PathBuf,
    pub limine_template: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            testing_dir: defaults::TESTING_DIR.into(),
            iso: defaults::ISO.into(),
            kernel: defaults::KERNEL.into(),
            sections_tool: defaults::SECTIONS_TOOL.into(),
            limine_template: defaults::LIMINE_TEMPLATE.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    pub qemu: String,
    pub cpus: u32,
    pub memory: String,
    pub firmware_dir: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            qemu: defaults::QEMU.to_string(),
            cpus: defaults::CPUS,
            memory: defaults::MEMORY.to_string(),
            firmware_dir: defaults::FIRMWARE_DIR.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SetupConfig {
    pub strategy: StrategyKind,
    pub mode: SetupMode,
    pub strict: bool,
}

impl SetupConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        if self.strict {
            FailurePolicy::Strict
        } else {
            FailurePolicy::Permissive
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BootloaderConfig {
    pub url: String,
    pub branch: String,
    pub depth: u32,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            url: defaults::LIMINE_URL.to_string(),
            branch: defaults::LIMINE_BRANCH.to_string(),
            depth: defaults::CLONE_DEPTH,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("Failed to parse configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Apply environment overrides using the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| env::var(key).ok());
    }

    /// Apply environment overrides from an arbitrary lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(OVMF_PATH_ENV) {
            self.launch.firmware_dir = dir.into();
        }
        if let Some(qemu) = lookup(QEMU_ENV) {
            self.launch.qemu = qemu;
        }
        if let Some(branch) = lookup(LIMINE_BRANCH_ENV) {
            self.bootloader.branch = branch;
        }
    }
}

/// A configuration bound to the project root it was loaded for.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
}

impl Project {
    /// Load configuration for `root`.
    ///
    /// An explicit config file must exist. Without one, `crescent-run.toml` in
    /// `root` is used if present, otherwise the defaults.
    pub fn load(root: impl Into<PathBuf>, explicit: Option<&Path>) -> Result<Self> {
        let root = root.into();
        let mut config = match explicit {
            Some(path) => Config::from_file(path)?,
            None => {
                let candidate = root.join(CONFIG_FILENAME);
                if candidate.is_file() {
                    log::info!("using configuration {}", candidate.display());
                    Config::from_file(&candidate)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_env();
        Ok(Self { root, config })
    }

    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Resolve `path` against the project root unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn testing_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.testing_dir)
    }

    pub fn iso(&self) -> PathBuf {
        self.resolve(&self.config.paths.iso)
    }

    pub fn kernel(&self) -> PathBuf {
        self.resolve(&self.config.paths.kernel)
    }

    pub fn sections_tool(&self) -> PathBuf {
        self.resolve(&self.config.paths.sections_tool)
    }

    pub fn limine_template(&self) -> PathBuf {
        self.resolve(&self.config.paths.limine_template)
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.resolve(&self.config.launch.firmware_dir)
    }

    pub fn image_tree(&self) -> ImageTree {
        ImageTree::new(self.testing_dir())
    }

    pub fn bootloader_source(&self) -> BootloaderSource {
        let b = &self.config.bootloader;
        BootloaderSource::new(&b.url, &b.branch, b.depth)
    }
}
