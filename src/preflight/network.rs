//! Network check for the pinned bootloader source.
//!
//! Verifies the branch exists upstream before setup clones it.

use std::time::Duration;

use super::CheckResult;
use crate::fetch::BootloaderSource;

const TIMEOUT: Duration = Duration::from_secs(15);

/// `git ls-remote --heads <url> <branch>` with a timeout.
pub async fn check_bootloader_source(source: &BootloaderSource) -> CheckResult {
    check_with(source, "git").await
}

async fn check_with(source: &BootloaderSource, git: &str) -> CheckResult {
    let ls_remote = tokio::process::Command::new(git)
        .args(["ls-remote", "--heads", &source.url, &source.branch])
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(TIMEOUT, ls_remote).await {
        Ok(Ok(output)) if output.status.success() && !output.stdout.is_empty() => {
            CheckResult::pass(
                "Bootloader source",
                format!("{} ({}) reachable", source.url, source.branch),
            )
        }
        Ok(Ok(output)) if output.status.success() => CheckResult::fail(
            "Bootloader source",
            format!("Branch {} not found at {}", source.branch, source.url),
            "Check [bootloader] branch in crescent-run.toml or CRESCENT_LIMINE_BRANCH",
        ),
        Ok(Ok(output)) => CheckResult::fail(
            "Bootloader source",
            format!(
                "{} unreachable: {}",
                source.url,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            "Check your internet connection or try again later",
        ),
        Ok(Err(e)) => CheckResult::fail(
            "Bootloader source",
            format!("Failed to run {}: {}", git, e),
            "Ensure git is installed",
        ),
        Err(_) => CheckResult::fail(
            "Bootloader source",
            format!("Timed out after {}s contacting {}", TIMEOUT.as_secs(), source.url),
            "Check your internet connection or try again later",
        ),
    }
}
