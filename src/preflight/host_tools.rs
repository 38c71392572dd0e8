//! Host tool validation.
//!
//! Checks that required external tools are installed and executable.

use super::CheckResult;
use crate::image::StrategyKind;
use crate::process::which;

/// Required host tools with their install suggestions.
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("git", "Clone the bootloader", "sudo dnf install git"),
    ("make", "Build the bootloader", "sudo dnf install make"),
    ("gdb", "Attach to a --debug launch", "sudo dnf install gdb"),
];

/// Packaging tool per provisioning strategy.
fn packaging_tool(strategy: StrategyKind) -> (&'static str, &'static str, &'static str) {
    match strategy {
        StrategyKind::Limine => ("xorriso", "Build bootable ISO", "sudo dnf install xorriso"),
        StrategyKind::Grub => (
            "grub-mkrescue",
            "Build bootable ISO",
            "sudo dnf install grub2-tools-extra xorriso",
        ),
    }
}

/// Check that all required host tools are installed.
pub fn check_host_tools(qemu: &str, strategy: StrategyKind) -> Vec<CheckResult> {
    let mut results = vec![check_tool(
        qemu,
        "Run the test image",
        "sudo dnf install qemu-system-x86-core",
    )];
    results.extend(
        REQUIRED_TOOLS
            .iter()
            .map(|(tool, purpose, install)| check_tool(tool, purpose, install)),
    );
    let (tool, purpose, install) = packaging_tool(strategy);
    results.push(check_tool(tool, purpose, install));
    results
}

fn check_tool(tool: &str, purpose: &str, install_cmd: &str) -> CheckResult {
    match which(tool) {
        Some(path) => CheckResult::pass(
            format!("{} tool", tool),
            format!("Found at {} ({})", path.display(), purpose),
        ),
        None => CheckResult::fail(
            format!("{} tool", tool),
            format!("Not found (needed for: {})", purpose),
            install_cmd,
        ),
    }
}
