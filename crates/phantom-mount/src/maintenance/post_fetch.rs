//! Post-fetch pass: bring the multi-pack-index and commit-graph up to
//! date over freshly downloaded packs. Enqueued ad hoc after a
//! prefetch rather than on a timer.

use std::time::Duration;

use tracing::info;

use phantom_config::logging::TELEMETRY_TARGET;

use super::{commit_graph, MaintenanceContext, MaintenanceStep, StepOutcome};

pub struct PostFetchStep {
    pack_indexes: Vec<String>,
}

impl PostFetchStep {
    pub fn new(pack_indexes: Vec<String>) -> Self {
        Self { pack_indexes }
    }
}

impl MaintenanceStep for PostFetchStep {
    fn name(&self) -> &'static str {
        "PostFetch"
    }

    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn run(&self, ctx: &MaintenanceContext) -> anyhow::Result<StepOutcome> {
        let object_dir = ctx.object_root.to_string_lossy().to_string();
        ctx.git.run(
            &["multi-pack-index", "write", "--object-dir", &object_dir],
            None,
        )?;

        let stdin = if self.pack_indexes.is_empty() {
            commit_graph::pack_list(ctx)?
        } else {
            let mut joined = self.pack_indexes.join("\n");
            joined.push('\n');
            joined
        };
        if !stdin.is_empty() {
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
        }

        ctx.odb.refresh_packs()?;
        info!(
            target: TELEMETRY_TARGET,
            step = self.name(),
            packs = self.pack_indexes.len(),
            "post-fetch maintenance complete"
        );
        Ok(StepOutcome::Ran)
    }
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
    fn writes_midx_then_commit_graph() {
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

        let step = PostFetchStep::new(vec!["pack-new.idx".to_string()]);
        assert_eq!(step.run(&ctx).unwrap(), StepOutcome::Ran);

        let calls = git.invocations.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][..2], ["multi-pack-index", "write"]);
        assert_eq!(calls[1][..2], ["commit-graph", "write"]);
    }
}
