//! Pinned bootloader fetch.
//!
//! Clones a pinned bootloader release shallowly into a scratch directory,
//! builds it with its own Makefile, copies a fixed set of outputs into the
//! image tree, and removes the scratch directory whatever happened.
//!
//! Every step is a stage of a [`Pipeline`]. Under [`FailurePolicy::Permissive`]
//! a failed clone or build does not stop the copies that follow, which then
//! run against files that were never produced. That is the historical
//! behavior and stays the default; [`FailurePolicy::Strict`] stops at the
//! first failed stage instead.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::process::{Cmd, ProcessResult};

/// A pinned upstream source: repository, branch or tag, and clone depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderSource {
    pub url: String,
    pub branch: String,
    pub depth: u32,
}

impl BootloaderSource {
    pub fn new(url: impl Into<String>, branch: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            depth,
        }
    }

    /// `git clone <url> --branch <branch> --depth <depth> <dest>`
    pub fn clone_cmd(&self, git: &str, dest: &Path) -> Cmd {
        Cmd::new(git)
            .arg("clone")
            .arg(&self.url)
            .args(["--branch", &self.branch])
            .args(["--depth", &self.depth.to_string()])
            .arg_path(dest)
    }
}

/// What to do when a setup stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Report the failure and keep going.
    #[default]
    Permissive,
    /// Stop at the first failure; remaining stages are skipped.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StageOutcome,
}

/// Ordered results of every stage a setup run went through.
#[derive(Debug, Clone, Default)]
pub struct SetupReport {
    pub stages: Vec<StageReport>,
}

impl SetupReport {
    pub fn is_ok(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.outcome == StageOutcome::Ok)
    }

    pub fn failures(&self) -> Vec<&StageReport> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed(_)))
            .collect()
    }

    pub fn first_failure(&self) -> Option<&StageReport> {
        self.failures().into_iter().next()
    }

    pub fn outcome_of(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.outcome)
    }

    pub fn print_summary(&self) {
        println!("=== Setup Stages ===\n");
        for s in &self.stages {
            match &s.outcome {
                StageOutcome::Ok => println!("[OK]   {}", s.stage),
                StageOutcome::Failed(msg) => println!("[FAIL] {}: {}", s.stage, msg),
                StageOutcome::Skipped => println!("[SKIP] {}", s.stage),
            }
        }
        println!();
    }
}

/// Runs setup stages in order under a [`FailurePolicy`].
#[derive(Debug)]
pub struct Pipeline {
    policy: FailurePolicy,
    report: SetupReport,
    halted: bool,
}

impl Pipeline {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            report: SetupReport::default(),
            halted: false,
        }
    }

    /// True once a strict pipeline has seen a failure.
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Run `f` as stage `name`, unless a strict pipeline already halted.
    ///
    /// Returns whether the stage succeeded.
    pub fn stage(&mut self, name: impl Into<String>, f: impl FnOnce() -> Result<()>) -> bool {
        let name = name.into();
        if self.halted {
            self.skip(name);
            return false;
        }

        log::info!("setup stage: {}", name);
        match f() {
            Ok(()) => {
                self.push(name, StageOutcome::Ok);
                true
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                match self.policy {
                    FailurePolicy::Strict => self.halted = true,
                    FailurePolicy::Permissive => log::warn!(
                        "stage '{}' failed, continuing (permissive setup): later stages may operate on missing files",
                        name
                    ),
                }
                self.push(name, StageOutcome::Failed(msg));
                false
            }
        }
    }

    /// Record a stage that was never attempted.
    pub fn skip(&mut self, name: impl Into<String>) {
        self.push(name.into(), StageOutcome::Skipped);
    }

    fn push(&mut self, stage: String, outcome: StageOutcome) {
        self.report.stages.push(StageReport { stage, outcome });
    }

    pub fn finish(self) -> SetupReport {
        self.report
    }
}

/// One bootloader output file and where it goes in the image tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStep {
    /// Path relative to the bootloader checkout.
    pub src: &'static str,
    /// Absolute destination.
    pub dest: PathBuf,
}

/// Clones, builds, and harvests a pinned bootloader release.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    source: BootloaderSource,
    git: String,
    make: String,
}

impl ArtifactFetcher {
    pub fn new(source: BootloaderSource) -> Self {
        Self {
            source,
            git: "git".to_string(),
            make: "make".to_string(),
        }
    }

    /// Use different `git`/`make` executables.
    pub fn with_programs(mut self, git: impl Into<String>, make: impl Into<String>) -> Self {
        self.git = git.into();
        self.make = make.into();
        self
    }

    /// Fetch into a scratch directory under `workdir_parent` and copy `plan`.
    ///
    /// The scratch directory is removed before this returns.
    pub fn fetch_into(&self, workdir_parent: &Path, plan: &[CopyStep], pipeline: &mut Pipeline) {
        let clone_stage = format!("clone {} ({})", self.source.url, self.source.branch);

        let workdir = match tempfile::Builder::new()
            .prefix(".bootloader-")
            .tempdir_in(workdir_parent)
        {
            Ok(dir) => dir,
            Err(e) => {
                pipeline.stage(clone_stage, || {
                    Err(anyhow!(e).context(format!(
                        "Failed to create scratch directory in {}",
                        workdir_parent.display()
                    )))
                });
                pipeline.skip("build bootloader");
                for step in plan {
                    pipeline.skip(format!("copy {}", step.src));
                }
                return;
            }
        };
        let checkout = workdir.path().join("checkout");

        pipeline.stage(clone_stage, || {
            let result = self
                .source
                .clone_cmd(&self.git, &checkout)
                .current_dir(workdir.path())
                .error_msg("Setup failed (failed to clone bootloader)")
                .capture();
            check("clone bootloader", result)
        });

        pipeline.stage("build bootloader", || {
            let result = Cmd::new(&self.make)
                .arg("-C")
                .arg_path(&checkout)
                .current_dir(workdir.path())
                .error_msg("Setup failed (failed to build bootloader)")
                .capture();
            check("build bootloader", result)
        });

        for step in plan {
            pipeline.stage(format!("copy {}", step.src), || {
                copy_file(&checkout.join(step.src), &step.dest)
            });
        }

        let scratch = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            log::warn!("Failed to remove {}: {}", scratch.display(), e);
        }
    }
}

fn check(what: &str, result: ProcessResult) -> Result<()> {
    if result.success() {
        return Ok(());
    }
    Err(Error::Process {
        what: what.to_string(),
        exit_code: result.exit_code,
        stderr: result.stderr.trim().to_string(),
    }
    .into())
}

fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest)
        .with_context(|| format!("Failed to copy {} -> {}", src.display(), dest.display()))?;
    Ok(())
}
