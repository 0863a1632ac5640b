//! The maintenance scheduler.
//!
//! A dedicated worker runs named steps strictly one at a time. Each
//! step carries a minimum inter-run interval persisted in a
//! `<step>.time` file (Unix-epoch seconds of the last successful run);
//! steps that rewrite the object directory also defer while a live
//! `git` process is working inside the enlistment. `force` bypasses
//! both gates (tests and explicit admin requests).

pub mod commit_graph;
pub mod config_step;
pub mod loose_objects;
pub mod packfile;
pub mod post_fetch;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use phantom_config::paths::EnlistmentLayout;
use phantom_odb::ObjectStore;

use crate::git::GitRunner;

/// How often the worker polls for due steps between commands.
const TICK: Duration = Duration::from_secs(60);

/// Everything a step may touch.
pub struct MaintenanceContext {
    pub odb: Arc<ObjectStore>,
    pub git: Arc<dyn GitRunner>,
    pub layout: EnlistmentLayout,
    /// The shared object root the steps compact.
    pub object_root: PathBuf,
    /// Directory holding the `<step>.time` gate files.
    pub time_dir: PathBuf,
    pub repack_batch_size: String,
    pub status_cache_file: Option<PathBuf>,
}

/// What a run attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ran,
    Skipped(String),
}

/// One named maintenance step.
pub trait MaintenanceStep: Send + Sync {
    fn name(&self) -> &'static str;
    fn min_interval(&self) -> Duration;
    /// Steps that rewrite packs defer while git runs in the enlistment.
    fn mutates_object_dir(&self) -> bool {
        true
    }
    fn run(&self, ctx: &MaintenanceContext) -> anyhow::Result<StepOutcome>;
}

/// Commands accepted by the worker.
#[derive(Debug)]
pub enum MaintenanceCommand {
    /// Run whatever is due (the periodic tick does this too).
    RunDue,
    /// Run one step; `force` bypasses the time and live-git gates.
    Run { step: StepKind, force: bool },
    /// Enqueue the post-fetch pass over freshly downloaded packs.
    PostFetch { pack_indexes: Vec<String> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Packfile,
    LooseObjects,
    CommitGraph,
    Config,
}

/// Sending half handed to the router and the mount context.
#[derive(Clone)]
pub struct MaintenanceHandle {
    tx: Sender<MaintenanceCommand>,
}

impl MaintenanceHandle {
    pub fn send(&self, command: MaintenanceCommand) {
        if self.tx.send(command).is_err() {
            warn!("maintenance worker is gone, command dropped");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(MaintenanceCommand::Shutdown);
    }
}

/// Reads the last successful run of `name` from its gate file.
pub fn last_run(time_dir: &Path, name: &str) -> Option<u64> {
    let raw = fs::read_to_string(time_dir.join(format!("{name}.time"))).ok()?;
    raw.trim().parse().ok()
}

/// Records a successful run of `name` at the current time.
pub fn record_run(time_dir: &Path, name: &str) -> std::io::Result<()> {
    fs::create_dir_all(time_dir)?;
    fs::write(
        time_dir.join(format!("{name}.time")),
        now_epoch().to_string(),
    )
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Live `git` processes working inside `root` defer pack mutation.
#[cfg(target_os = "linux")]
pub fn git_running_in(root: &Path) -> bool {
    let Ok(entries) = fs::read_dir("/proc") else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let comm = fs::read_to_string(format!("/proc/{pid}/comm")).unwrap_or_default();
        if comm.trim() != "git" {
            continue;
        }
        if let Ok(cwd) = fs::read_link(format!("/proc/{pid}/cwd")) {
            if cwd.starts_with(root) {
                return true;
            }
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
pub fn git_running_in(_root: &Path) -> bool {
    false
}

/// The worker itself. Owns the built-in steps in priority order.
pub struct Scheduler {
    ctx: MaintenanceContext,
    steps: Vec<(StepKind, Box<dyn MaintenanceStep>)>,
    rx: Receiver<MaintenanceCommand>,
}

impl Scheduler {
    pub fn new(ctx: MaintenanceContext, rx: Receiver<MaintenanceCommand>) -> Self {
        let steps: Vec<(StepKind, Box<dyn MaintenanceStep>)> = vec![
            (StepKind::Config, Box::new(config_step::ConfigStep)),
            (
                StepKind::Packfile,
                Box::new(packfile::PackfileMaintenanceStep),
            ),
            (
                StepKind::LooseObjects,
                Box::new(loose_objects::LooseObjectsStep),
            ),
            (StepKind::CommitGraph, Box::new(commit_graph::CommitGraphStep)),
        ];
        Self { ctx, steps, rx }
    }

    /// Creates the channel pair and spawns the worker thread.
    pub fn spawn(ctx: MaintenanceContext) -> (MaintenanceHandle, std::thread::JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Self::new(ctx, rx);
        let join = std::thread::Builder::new()
            .name("phantom-maintenance".to_string())
            .spawn(move || scheduler.run())
            .expect("spawn maintenance thread");
        (MaintenanceHandle { tx }, join)
    }

    fn run(self) {
        info!("maintenance worker started");
        loop {
            match self.rx.recv_timeout(TICK) {
                Ok(MaintenanceCommand::Shutdown) => break,
                Ok(MaintenanceCommand::RunDue) | Err(RecvTimeoutError::Timeout) => {
                    self.run_due();
                }
                Ok(MaintenanceCommand::Run { step, force }) => {
                    if let Some((_, found)) = self.steps.iter().find(|(kind, _)| *kind == step) {
                        self.run_step(found.as_ref(), force);
                    }
                }
                Ok(MaintenanceCommand::PostFetch { pack_indexes }) => {
                    let step = post_fetch::PostFetchStep::new(pack_indexes);
                    self.run_step(&step, true);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("maintenance worker stopped");
    }

    fn run_due(&self) {
        for (_, step) in &self.steps {
            self.run_step(step.as_ref(), false);
        }
    }

    /// Runs one step through both gates. Serial by construction: the
    /// worker thread is the only caller.
    pub fn run_step(&self, step: &dyn MaintenanceStep, force: bool) -> StepOutcome {
        if !force {
            if let Some(last) = last_run(&self.ctx.time_dir, step.name()) {
                let elapsed = now_epoch().saturating_sub(last);
                if elapsed < step.min_interval().as_secs() {
                    warn!(
                        step = step.name(),
                        elapsed_secs = elapsed,
                        "skipping step, interval not elapsed"
                    );
                    return StepOutcome::Skipped("interval not elapsed".to_string());
                }
            }
            if step.mutates_object_dir() && git_running_in(self.ctx.layout.root()) {
                info!(step = step.name(), "deferring step, git is running here");
                return StepOutcome::Skipped("git running in enlistment".to_string());
            }
        }

        debug!(step = step.name(), force, "running maintenance step");
        match step.run(&self.ctx) {
            Ok(StepOutcome::Ran) => {
                if let Err(e) = record_run(&self.ctx.time_dir, step.name()) {
                    warn!(step = step.name(), error = %e, "failed to record step run");
                }
                StepOutcome::Ran
            }
            Ok(StepOutcome::Skipped(reason)) => {
                debug!(step = step.name(), reason = %reason, "step skipped itself");
                StepOutcome::Skipped(reason)
            }
            Err(e) => {
                // Maintenance never takes the mount down; log and move on.
                error!(step = step.name(), error = %e, "maintenance step failed");
                StepOutcome::Skipped(format!("failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::RecordingGit;
    use tempfile::TempDir;

    fn test_ctx(temp: &TempDir, git: Arc<RecordingGit>) -> MaintenanceContext {
        let object_root = temp.path().join("objects");
        let odb = Arc::new(ObjectStore::open(&object_root).unwrap());
        MaintenanceContext {
            odb,
            git,
            layout: EnlistmentLayout::new(temp.path().join("enlistment")),
            object_root,
            time_dir: temp.path().join("maintenance"),
            repack_batch_size: "2g".to_string(),
            status_cache_file: None,
        }
    }

    fn scheduler(ctx: MaintenanceContext) -> Scheduler {
        let (_tx, rx) = crossbeam_channel::unbounded();
        Scheduler::new(ctx, rx)
    }

    #[test]
    fn time_gate_skips_fresh_step() {
        // Last-run stamped now: the step must not run and must not
        // touch git or the stamp.
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let ctx = test_ctx(&temp, git.clone());
        record_run(&ctx.time_dir, "PackfileMaintenance").unwrap();
        let stamp_before = last_run(&ctx.time_dir, "PackfileMaintenance").unwrap();

        let scheduler = scheduler(ctx);
        let outcome =
            scheduler.run_step(&packfile::PackfileMaintenanceStep, false);

        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert_eq!(git.call_count(), 0);
        assert_eq!(
            last_run(&scheduler.ctx.time_dir, "PackfileMaintenance").unwrap(),
            stamp_before
        );
    }

    #[test]
    fn elapsed_interval_lets_step_run() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let ctx = test_ctx(&temp, git.clone());

        // Stamp two days ago.
        fs::create_dir_all(&ctx.time_dir).unwrap();
        let old = now_epoch() - 2 * 24 * 3600;
        fs::write(ctx.time_dir.join("Config.time"), old.to_string()).unwrap();

        let scheduler = scheduler(ctx);
        let outcome = scheduler.run_step(&config_step::ConfigStep, false);
        assert_eq!(outcome, StepOutcome::Ran);
        assert!(git.call_count() > 0);
        assert!(last_run(&scheduler.ctx.time_dir, "Config").unwrap() > old);
    }

    #[test]
    fn force_bypasses_time_gate() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let ctx = test_ctx(&temp, git.clone());
        record_run(&ctx.time_dir, "Config").unwrap();

        let scheduler = scheduler(ctx);
        let outcome = scheduler.run_step(&config_step::ConfigStep, true);
        assert_eq!(outcome, StepOutcome::Ran);
        assert!(git.call_count() > 0);
    }

    #[test]
    fn failing_step_does_not_update_stamp() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        git.scripted.lock().push(Err(crate::git::GitError::NonZero {
            args: "config".to_string(),
            code: 128,
            stdout: String::new(),
            stderr: "boom".to_string(),
        }));
        let ctx = test_ctx(&temp, git);

        let scheduler = scheduler(ctx);
        let outcome = scheduler.run_step(&config_step::ConfigStep, true);
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert!(last_run(&scheduler.ctx.time_dir, "Config").is_none());
    }

    #[test]
    fn successive_runs_respect_interval() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let ctx = test_ctx(&temp, git.clone());
        let scheduler = scheduler(ctx);

        assert_eq!(
            scheduler.run_step(&config_step::ConfigStep, false),
            StepOutcome::Ran
        );
        let calls_after_first = git.call_count();
        // The immediate second run is inside the interval.
        assert!(matches!(
            scheduler.run_step(&config_step::ConfigStep, false),
            StepOutcome::Skipped(_)
        ));
        assert_eq!(git.call_count(), calls_after_first);
    }
}
