//! Loose-object packing: roll accumulated loose objects into a pack,
//! then prune the packed originals.

use std::time::Duration;

use tracing::info;

use phantom_config::logging::TELEMETRY_TARGET;

use super::{MaintenanceContext, MaintenanceStep, StepOutcome};

pub struct LooseObjectsStep;

impl MaintenanceStep for LooseObjectsStep {
    fn name(&self) -> &'static str {
        "LooseObjects"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn run(&self, ctx: &MaintenanceContext) -> anyhow::Result<StepOutcome> {
        let oids = ctx.odb.loose().iter_oids()?;
        if oids.is_empty() {
            return Ok(StepOutcome::Skipped("no loose objects".to_string()));
        }

        let mut stdin = String::with_capacity(oids.len() * 41);
        for oid in &oids {
            stdin.push_str(&oid.to_hex());
            stdin.push('\n');
        }

        let prefix = ctx.odb.pack_dir().join("pack");
        let prefix = prefix.to_string_lossy().to_string();
        ctx.git.run(
            &["pack-objects", "-q", "--non-empty", &prefix],
            Some(stdin.as_bytes()),
        )?;

        // The originals are now packed; prune them.
        let packed = oids.len();
        for oid in &oids {
            ctx.odb.loose().remove(oid)?;
        }
        ctx.odb.refresh_packs()?;

        info!(
            target: TELEMETRY_TARGET,
            step = self.name(),
            packed,
            "loose objects packed"
        );
        Ok(StepOutcome::Ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::RecordingGit;
    use phantom_config::paths::EnlistmentLayout;
    use phantom_odb::{ObjectStore, ObjectType};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(temp: &TempDir, git: Arc<RecordingGit>) -> MaintenanceContext {
        let object_root = temp.path().join("objects");
        MaintenanceContext {
            odb: Arc::new(ObjectStore::open(&object_root).unwrap()),
            git,
            layout: EnlistmentLayout::new(temp.path()),
            object_root,
            time_dir: temp.path().join("time"),
            repack_batch_size: "2g".to_string(),
            status_cache_file: None,
        }
    }

    #[test]
    fn skips_when_no_loose_objects() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let outcome = LooseObjectsStep.run(&ctx(&temp, git.clone())).unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert_eq!(git.call_count(), 0);
    }

    #[test]
    fn packs_and_prunes_loose_objects() {
        let temp = TempDir::new().unwrap();
        let git = Arc::new(RecordingGit::new());
        let ctx = ctx(&temp, git.clone());
        let a = ctx.odb.loose().write_object(ObjectType::Blob, b"a").unwrap();
        let b = ctx.odb.loose().write_object(ObjectType::Blob, b"b").unwrap();

        let outcome = LooseObjectsStep.run(&ctx).unwrap();
        assert_eq!(outcome, StepOutcome::Ran);

        let calls = git.invocations.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "pack-objects");
        assert!(!ctx.odb.loose().contains(&a));
        assert!(!ctx.odb.loose().contains(&b));
    }
}
