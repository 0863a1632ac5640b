//! Re-applies the required Git config keys so drift is healed without
//! a remount.

use std::time::Duration;

use tracing::info;

use phantom_config::gitconfig::required_git_config;
use phantom_config::logging::TELEMETRY_TARGET;

use super::{MaintenanceContext, MaintenanceStep, StepOutcome};

pub struct ConfigStep;

impl MaintenanceStep for ConfigStep {
    fn name(&self) -> &'static str {
        "Config"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn mutates_object_dir(&self) -> bool {
        false
    }

    fn run(&self, ctx: &MaintenanceContext) -> anyhow::Result<StepOutcome> {
        let entries = required_git_config(&ctx.layout, ctx.status_cache_file.as_deref());
        let applied = entries.len();
        for (key, value) in &entries {
            ctx.git.run(&["config", "--local", key, value], None)?;
        }
        info!(target: TELEMETRY_TARGET, step = self.name(), applied, "git config applied");
        Ok(StepOutcome::Ran)
    }
}
