//! phantom-mount: mounts an enlistment and serves it until unmount.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use phantom_config::logging::init_logging;
use phantom_config::paths::EnlistmentLayout;
use phantom_mount::{exit_code, run, MountContext, MountError, MountOptions};

#[derive(Parser, Debug)]
#[command(name = "phantom-mount", about = "Mount a virtualized Git enlistment")]
struct Args {
    /// Enlistment root (the directory containing src/, .git/, .gvfs/).
    enlistment: PathBuf,

    /// Git binary to invoke for maintenance and credentials.
    #[arg(long, default_value = "git")]
    git_binary: PathBuf,

    /// Local cache root recorded on first mount.
    #[arg(long)]
    local_cache: Option<PathBuf>,
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let layout = EnlistmentLayout::new(&args.enlistment);
    if !layout.looks_valid() {
        eprintln!(
            "error: {} is not a mountable enlistment (missing .git or .gvfs)",
            args.enlistment.display()
        );
        return exit(exit_code::MOUNT_POINT_INVALID);
    }

    let log_file = init_logging(&layout.logs_dir(), "phantom-mount");
    if let Some(path) = &log_file {
        eprintln!("logging to {}", path.display());
    }
    info!(enlistment = %args.enlistment.display(), "mount starting");

    let mut options = MountOptions::new(&args.enlistment);
    options.git_binary = args.git_binary;
    options.local_cache_override = args.local_cache;

    let ctx = match MountContext::bootstrap(options) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "mount bootstrap failed");
            eprintln!("error: {e}");
            return exit(match e {
                MountError::Precondition(ref detail) if detail.contains("disk layout") => {
                    exit_code::REBASELINE_REQUIRED
                }
                MountError::Precondition(_) => exit_code::MOUNT_POINT_INVALID,
                _ => exit_code::GENERIC_FAILURE,
            });
        }
    };

    // Ctrl-C and SIGTERM behave like an Unmount request.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, unmounting");
            ctx.begin_unmount();
        });
    }

    match run(ctx).await {
        Ok(()) => {
            info!("unmounted cleanly");
            exit(exit_code::SUCCESS)
        }
        Err(MountError::FilterMissing) => {
            eprintln!("error: kernel filter driver is not installed (set GVFS_NO_FILTER=1 for IPC-only development mounts)");
            exit(exit_code::FILTER_DRIVER_MISSING)
        }
        Err(e) => {
            error!(error = %e, "mount failed");
            eprintln!("error: {e}");
            exit(exit_code::GENERIC_FAILURE)
        }
    }
}
