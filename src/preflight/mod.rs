//! Preflight checks for the Crescent test environment.
//!
//! Validates the host BEFORE setup or launch, so a missing tool shows up as
//! one readable line instead of a half-provisioned image tree.
//!
//! # Checks Performed
//!
//! - **Host tools**: QEMU, git, make, gdb, and the packaging tool for the
//!   configured strategy
//! - **Firmware**: OVMF code and vars images in the firmware directory
//! - **Network**: the pinned bootloader branch is reachable
//! - **Image status**: reports what's already built
//!
//! # Usage
//!
//! ```rust,ignore
//! use crescent_run::preflight::PreflightChecker;
//!
//! let checker = PreflightChecker::new(project);
//! let report = checker.run_all().await;
//! report.print_summary();
//! ```

mod firmware;
mod host_tools;
mod network;

pub use firmware::check_firmware;
pub use host_tools::check_host_tools;
pub use network::check_bootloader_source;

use crate::config::Project;
use crate::image::StrategyKind;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Human-readable message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

impl CheckResult {
    /// Create a passing check result.
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            suggestion: None,
        }
    }

    /// Create a failing check result.
    pub fn fail(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a warning check result (passes but with a note).
    pub fn warn(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
    pub image_status: ImageStatus,
}

impl PreflightReport {
    /// Check if all preflight checks passed.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Print a summary of the preflight checks.
    pub fn print_summary(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let status = if check.passed { "[OK]" } else { "[FAIL]" };
            println!("{} {}: {}", status, check.name, check.message);
            if let Some(suggestion) = &check.suggestion {
                println!("     Suggestion: {}", suggestion);
            }
        }

        println!();
        println!("=== Image Status ===\n");
        self.image_status.print();

        println!();
        if self.is_ok() {
            println!("All preflight checks passed ({}/{})", self.passed_count(), self.total_count());
        } else {
            println!(
                "Preflight checks failed: {} of {} passed",
                self.passed_count(),
                self.total_count()
            );
        }
    }
}

/// What already exists on disk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImageStatus {
    pub has_tree: bool,
    pub has_medium: bool,
    pub has_kernel: bool,
    pub has_sections_tool: bool,
}

impl ImageStatus {
    pub fn of(project: &Project) -> Self {
        Self {
            has_tree: project.image_tree().iso_root().is_dir(),
            has_medium: project.iso().is_file(),
            has_kernel: project.kernel().is_file(),
            has_sections_tool: project.sections_tool().is_file(),
        }
    }

    pub fn print(&self) {
        let status = |b: bool| if b { "[present]" } else { "[missing]" };

        println!("{}  Image tree (run with --setup)", status(self.has_tree));
        println!("{}  Bootable medium (crescent-run package)", status(self.has_medium));
        println!("{}  Kernel binary", status(self.has_kernel));
        println!("{}  Section tool", status(self.has_sections_tool));
    }
}

pub struct PreflightChecker {
    project: Project,
}

impl PreflightChecker {
    pub fn new(project: Project) -> Self {
        Self { project }
    }

    /// Run all preflight checks and return a comprehensive report.
    pub async fn run_all(&self) -> PreflightReport {
        let config = &self.project.config;
        let mut report = PreflightReport::default();

        report
            .checks
            .extend(check_host_tools(&config.launch.qemu, config.setup.strategy));
        report
            .checks
            .extend(check_firmware(&self.project.firmware_dir()));

        // Only the Limine strategy fetches anything
        if config.setup.strategy == StrategyKind::Limine {
            report
                .checks
                .push(check_bootloader_source(&self.project.bootloader_source()).await);
        }

        report.image_status = ImageStatus::of(&self.project);
        report
    }
}
