//! The Git config keys this system requires in every enlistment.
//!
//! Applied by the maintenance Config step on a schedule so drift (a user
//! running `git config`, a Git upgrade) is healed without remounting.

use crate::paths::EnlistmentLayout;

/// Keys whose values do not depend on the enlistment.
pub const FIXED_GIT_CONFIG: &[(&str, &str)] = &[
    ("core.autocrlf", "false"),
    ("core.safecrlf", "false"),
    ("core.fscache", "true"),
    ("core.commitGraph", "true"),
    ("core.multiPackIndex", "true"),
    ("core.gvfs", "true"),
    ("core.preloadIndex", "true"),
    ("gc.auto", "0"),
    ("receive.autogc", "false"),
    ("diff.autoRefreshIndex", "false"),
    ("index.version", "4"),
    ("index.threads", "true"),
    ("core.splitIndex", "false"),
    ("credential.validate", "false"),
    ("credential.useHttpPath", "true"),
    ("pack.useBitmaps", "false"),
    ("repack.writeBitmaps", "false"),
    ("merge.stat", "false"),
    ("fetch.unpackLimit", "1"),
];

/// The full required set, including enlistment-dependent values.
pub fn required_git_config(
    layout: &EnlistmentLayout,
    status_cache_file: Option<&std::path::Path>,
) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = FIXED_GIT_CONFIG
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    entries.push((
        "core.virtualFilesystem".to_string(),
        layout
            .git_hooks()
            .join("virtual-filesystem")
            .to_string_lossy()
            .to_string(),
    ));
    entries.push((
        "core.hooksPath".to_string(),
        layout.git_hooks().to_string_lossy().to_string(),
    ));
    if let Some(path) = status_cache_file {
        entries.push((
            "status.deserializePath".to_string(),
            path.to_string_lossy().to_string(),
        ));
    }
    entries
}
