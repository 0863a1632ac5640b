//! Commit-graph maintenance: append a graph layer covering the packs
//! currently in the shared object root.

use std::time::Duration;

use tracing::info;

use phantom_config::logging::TELEMETRY_TARGET;

use super::{MaintenanceContext, MaintenanceStep, StepOutcome};

pub struct CommitGraphStep;

impl MaintenanceStep for CommitGraphStep {
    fn name(&self) -> &'static str {
        "CommitGraph"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn run(&self, ctx: &MaintenanceContext) -> anyhow::Result<StepOutcome> {
        let stdin = pack_list(ctx)?;
        if stdin.is_empty() {
            return Ok(StepOutcome::Skipped("no packs to cover".to_string()));
        }

        let object_dir = ctx.object_root.to_string_lossy().to_string();
        ctx.git.run(
            &[
                "commit-graph",
                "write",
                "--stdin-packs",
                "--append",
                "--object-dir",
                &object_dir,
            ],
            Some(stdin.as_bytes()),
        )?;

        info!(target: TELEMETRY_TARGET, step = self.name(), "commit-graph appended");
        Ok(StepOutcome::Ran)
    }
}

/// Newline-separated pack index names for `--stdin-packs`.
pub(super) fn pack_list(ctx: &MaintenanceContext) -> anyhow::Result<String> {
    let mut stdin = String::new();
    for idx_path in ctx.odb.iter_pack_indexes()? {
        if let Some(name) = idx_path.file_name().and_then(|n| n.to_str()) {
            stdin.push_str(name);
            stdin.push('\n');
        }
    }
    Ok(stdin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::RecordingGit;
    use phantom_config::paths::EnlistmentLayout;
    use phantom_odb::ObjectStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn skips_without_packs() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let object_root = temp.path().join("objects");
        let ctx = MaintenanceContext {
            odb: Arc::new(ObjectStore::open(&object_root).unwrap()),
            git: git.clone(),
            layout: EnlistmentLayout::new(temp.path()),
            object_root,
            time_dir: temp.path().join("time"),
            repack_batch_size: "2g".to_string(),
            status_cache_file: None,
        };

        let outcome = CommitGraphStep.run(&ctx).unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert_eq!(git.call_count(), 0);
    }

    #[test]
    fn appends_covering_existing_packs() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let object_root = temp.path().join("objects");
        let odb = Arc::new(ObjectStore::open(&object_root).unwrap());
        std::fs::write(odb.pack_dir().join("pack-a.idx"), b"x").unwrap();
        std::fs::write(odb.pack_dir().join("pack-a.pack"), b"x").unwrap();

        let ctx = MaintenanceContext {
            odb,
            git: git.clone(),
            layout: EnlistmentLayout::new(temp.path()),
            object_root,
            time_dir: temp.path().join("time"),
            repack_batch_size: "2g".to_string(),
            status_cache_file: None,
        };

        let outcome = CommitGraphStep.run(&ctx).unwrap();
        assert_eq!(outcome, StepOutcome::Ran);
        let calls = git.invocations.lock().clone();
        assert_eq!(calls[0][..2], ["commit-graph", "write"]);
        assert!(calls[0].iter().any(|a| a == "--append"));
    }
}
