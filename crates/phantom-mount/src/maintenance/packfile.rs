//! Packfile maintenance: expire the multi-pack-index, sweep orphaned
//! `.idx` files, then repack in batches.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use phantom_config::logging::TELEMETRY_TARGET;

use super::{MaintenanceContext, MaintenanceStep, StepOutcome};

pub struct PackfileMaintenanceStep;

impl MaintenanceStep for PackfileMaintenanceStep {
    fn name(&self) -> &'static str {
        "PackfileMaintenance"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn run(&self, ctx: &MaintenanceContext) -> anyhow::Result<StepOutcome> {
        let pack_dir = ctx.odb.pack_dir().to_path_buf();

        // No .keep marker means no pack here is ours; leave Git's own
        // packs to Git.
        if !has_keep_file(&pack_dir)? {
            debug!("no keep-marked packs, skipping packfile maintenance");
            return Ok(StepOutcome::Skipped("no packs owned by this mount".to_string()));
        }

        let object_dir = ctx.object_root.to_string_lossy().to_string();
        let (before_count, before_bytes) = survey_packs(&pack_dir)?;

        ctx.git.run(
            &["multi-pack-index", "expire", "--object-dir", &object_dir],
            None,
        )?;

        // The expire leaves behind .idx files whose .pack it could not
        // delete under open handles; sweep them here.
        let stale = clean_stale_idx_files(&pack_dir)?;

        let batch = format!("--batch-size={}", ctx.repack_batch_size);
        ctx.git.run(
            &[
                "multi-pack-index",
                "repack",
                "--object-dir",
                &object_dir,
                &batch,
            ],
            None,
        )?;

        ctx.odb.refresh_packs()?;
        let (after_count, after_bytes) = survey_packs(&pack_dir)?;
        info!(
            target: TELEMETRY_TARGET,
            step = self.name(),
            before_count,
            before_bytes,
            stale_idx_removed = stale.len(),
            after_count,
            after_bytes,
            "packfile maintenance complete"
        );
        Ok(StepOutcome::Ran)
    }
}

fn has_keep_file(pack_dir: &Path) -> std::io::Result<bool> {
    for entry in fs::read_dir(pack_dir)? {
        if entry?.path().extension().is_some_and(|ext| ext == "keep") {
            return Ok(true);
        }
    }
    Ok(false)
}

fn survey_packs(pack_dir: &Path) -> std::io::Result<(u64, u64)> {
    let mut count = 0u64;
    let mut bytes = 0u64;
    for entry in fs::read_dir(pack_dir)? {
        let entry = entry?;
        if entry.path().extension().is_some_and(|ext| ext == "pack") {
            count += 1;
            bytes += entry.metadata()?.len();
        }
    }
    Ok((count, bytes))
}

/// Deletes `.idx` files whose matching `.pack` is gone. Returns the
/// file names removed.
pub fn clean_stale_idx_files(pack_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut removed = Vec::new();
    for entry in fs::read_dir(pack_dir)? {
        let path = entry?.path();
        if !path.extension().is_some_and(|ext| ext == "idx") {
            continue;
        }
        if path.with_extension("pack").exists() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            fs::remove_file(&path)?;
            info!(file = name, "removed stale pack index");
            removed.push(name.to_string());
        }
    }
    removed.sort();
    Ok(removed)
}
