//! # phantom-mount
//!
//! The mount process: projects a Git index into a virtualized working
//! tree, hydrates file content on demand from the remote object
//! service, tracks user modifications, compacts the shared object
//! cache on a schedule, and answers hook/CLI requests over the
//! enlistment pipe.
//!
//! All shared state hangs off one [`MountContext`] built in
//! [`MountContext::bootstrap`] and owned by the process; workers hold
//! `Arc`s to the pieces they need, never cycles.

pub mod blob_sizes;
pub mod cache;
pub mod callbacks;
pub mod counters;
pub mod error;
pub mod git;
pub mod heartbeat;
pub mod maintenance;
pub mod platform;
pub mod router;
pub mod state;

pub use error::{exit_code, MountError, Result};

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use phantom_config::paths::{EnlistmentLayout, LocalCache};
use phantom_config::{CoreConfig, RepoMetadata};
use phantom_fetch::{CredentialStore, Endpoints, HelperCredentialSource, ObjectRequester, RetryPolicy};
use phantom_index::Projector;
use phantom_ipc::StatusPayload;
use phantom_journal::ModifiedPaths;
use phantom_lock::WorkingTreeLock;
use phantom_odb::{store::ensure_alternates, ObjectStore};

use crate::blob_sizes::BlobSizes;
use crate::cache::{ObjectCache, ObjectFetcher};
use crate::callbacks::VirtualizationSurface;
use crate::counters::ActivityCounters;
use crate::git::{GitProcess, GitRunner};
use crate::maintenance::{MaintenanceCommand, MaintenanceContext, MaintenanceHandle, Scheduler};
use crate::state::{MountState, MountStateCell};

/// How a mount is brought up. The overrides are seams for tests.
pub struct MountOptions {
    pub enlistment: PathBuf,
    pub git_binary: PathBuf,
    /// Overrides the local cache root recorded in repo metadata on
    /// first mount.
    pub local_cache_override: Option<PathBuf>,
    pub fetcher_override: Option<Arc<dyn ObjectFetcher>>,
    pub git_override: Option<Arc<dyn GitRunner>>,
}

impl MountOptions {
    pub fn new<P: Into<PathBuf>>(enlistment: P) -> Self {
        Self {
            enlistment: enlistment.into(),
            git_binary: PathBuf::from("git"),
            local_cache_override: None,
            fetcher_override: None,
            git_override: None,
        }
    }
}

/// The context bundle every worker borrows from.
pub struct MountContext {
    pub layout: EnlistmentLayout,
    pub config: CoreConfig,
    pub metadata: RepoMetadata,
    /// Refreshed every mount; dies with the process.
    pub mount_id: Uuid,
    pub state: MountStateCell,
    pub odb: Arc<ObjectStore>,
    pub blob_sizes: Arc<BlobSizes>,
    pub counters: Arc<ActivityCounters>,
    pub projector: Projector,
    pub journal: ModifiedPaths,
    pub lock: WorkingTreeLock,
    pub cache: ObjectCache,
    pub maintenance: MaintenanceHandle,
    pub cancel: CancellationToken,
    pub local_cache_root: PathBuf,
    cache_server_display: String,
}

impl MountContext {
    /// Builds every component for a mount. Must run inside a tokio
    /// runtime (the cache worker is spawned here).
    pub fn bootstrap(options: MountOptions) -> Result<Arc<Self>> {
        let layout = EnlistmentLayout::new(&options.enlistment);
        layout.ensure_dirs()?;
        let config = CoreConfig::load(&layout.config_file())?;

        let git: Arc<dyn GitRunner> = match options.git_override.clone() {
            Some(git) => git,
            None => Arc::new(GitProcess::new(
                options.git_binary.clone(),
                layout.root().to_path_buf(),
            )),
        };

        let metadata = Self::load_or_init_metadata(&layout, &options, git.as_ref())?;
        let local_cache_root = PathBuf::from(metadata.local_cache_root()?);
        let local_cache = LocalCache::new(&local_cache_root);
        let cache_key = local_cache.resolve_cache_key(metadata.enlistment_id()?)?;
        let objects_root = local_cache.git_objects_dir(&cache_key);

        let odb = Arc::new(ObjectStore::open(&objects_root)?);
        ensure_alternates(&layout.git_objects(), &objects_root)?;

        let journal = ModifiedPaths::open(layout.modified_paths_file())?;
        let projector = Projector::open(layout.git_index())?;
        let blob_sizes = Arc::new(BlobSizes::open(layout.blob_sizes_dir())?);
        let counters = Arc::new(ActivityCounters::default());
        let cancel = CancellationToken::new();

        let fetcher: Arc<dyn ObjectFetcher> = match options.fetcher_override.clone() {
            Some(fetcher) => fetcher,
            None => {
                let repo_url = metadata.repo_url()?.to_string();
                let endpoints = Endpoints::from_repo_url(
                    &repo_url,
                    config.cache_server_url.as_deref(),
                    config.allow_insecure_http,
                )
                .map_err(MountError::from)?;
                let creds = CredentialStore::new(Arc::new(HelperCredentialSource::via_git(
                    options.git_binary.clone(),
                )));
                let policy = RetryPolicy::new(config.max_retries, config.timeout_seconds);
                Arc::new(
                    ObjectRequester::new(endpoints, creds, policy).map_err(MountError::from)?,
                )
            }
        };

        let (cache, _cache_worker) = ObjectCache::spawn(
            odb.clone(),
            blob_sizes.clone(),
            counters.clone(),
            fetcher,
            Duration::from_millis(config.batch_window_ms),
            cancel.clone(),
        );

        let platform = platform::current();
        let status_cache_file = platform
            .supports_status_cache()
            .then(|| local_cache.status_cache_dir(&cache_key).join("status.dat"));
        let (maintenance, _maintenance_thread) = Scheduler::spawn(MaintenanceContext {
            odb: odb.clone(),
            git,
            layout: layout.clone(),
            object_root: objects_root,
            time_dir: layout.maintenance_dir(),
            repack_batch_size: config.repack_batch_size.clone(),
            status_cache_file,
        });

        let cache_server_display = config
            .cache_server_url
            .clone()
            .unwrap_or_else(|| "None (origin)".to_string());

        info!(
            enlistment = %layout.root().display(),
            cache_key = %cache_key,
            "mount context ready"
        );
        Ok(Arc::new(Self {
            layout,
            config,
            metadata,
            mount_id: Uuid::new_v4(),
            state: MountStateCell::default(),
            odb,
            blob_sizes,
            counters,
            projector,
            journal,
            lock: WorkingTreeLock::new(),
            cache,
            maintenance,
            cancel,
            local_cache_root,
            cache_server_display,
        }))
    }

    fn load_or_init_metadata(
        layout: &EnlistmentLayout,
        options: &MountOptions,
        git: &dyn GitRunner,
    ) -> Result<RepoMetadata> {
        let path = layout.metadata_file();
        if path.exists() {
            return Ok(RepoMetadata::load(&path)?);
        }

        // First mount after clone: mint the enlistment identity.
        let repo_url = git
            .run(&["config", "--get", "remote.origin.url"], None)
            .map(|out| out.stdout.trim().to_string())
            .map_err(|e| {
                MountError::Precondition(format!("cannot determine origin URL: {e}"))
            })?;
        let cache_root = options
            .local_cache_override
            .clone()
            .or_else(|| std::env::var("GVFS_LOCAL_CACHE_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".phantomCache")
            });
        Ok(RepoMetadata::initialize(&path, &repo_url, &cache_root)?)
    }

    pub fn mark_ready(&self) {
        self.state.set(MountState::Ready);
        info!(mount_id = %self.mount_id, "mount ready");
    }

    /// The `GetStatus` body.
    pub fn status_payload(&self) -> StatusPayload {
        StatusPayload {
            enlistment_root: self.layout.root().display().to_string(),
            local_cache_root: self.local_cache_root.display().to_string(),
            repo_url: self.metadata.repo_url().unwrap_or_default().to_string(),
            cache_server: self.cache_server_display.clone(),
            lock_status: self.lock.status(),
            disk_layout_version: self.metadata.disk_layout_version(),
            mount_status: self.state.get().as_str().to_string(),
            background_operation_count: self.counters.background_ops.load(Ordering::Relaxed),
        }
    }

    /// Orderly unmount: terminal state first so callbacks fail fast,
    /// then flush durable state, stop the workers, and release
    /// everything waiting on the cancellation token.
    pub fn begin_unmount(&self) {
        if self.state.begin_unmount() == MountState::Unmounting {
            return;
        }
        info!(mount_id = %self.mount_id, "unmounting");
        if let Err(e) = self.journal.flush() {
            warn!(error = %e, "journal flush at unmount failed");
        }
        if let Err(e) = self.blob_sizes.sync() {
            warn!(error = %e, "blob-sizes sync at unmount failed");
        }
        self.maintenance.shutdown();
        self.cancel.cancel();
    }
}

/// Runs a bootstrapped mount until unmount or fatal error.
pub async fn run(ctx: Arc<MountContext>) -> Result<()> {
    let surface = Arc::new(VirtualizationSurface::new(ctx.clone()));

    let filter = match platform::attach_filter() {
        Ok(filter) => {
            filter
                .start(surface.clone())
                .map_err(|e| MountError::Fatal(format!("filter start: {e}")))?;
            Some(filter)
        }
        Err(platform::FilterError::DriverMissing) if ctx.config.allow_missing_filter => {
            warn!("kernel filter missing; serving IPC only");
            None
        }
        Err(platform::FilterError::DriverMissing) => return Err(MountError::FilterMissing),
        Err(e) => return Err(MountError::Fatal(format!("filter attach: {e}"))),
    };

    ctx.mark_ready();
    ctx.maintenance.send(MaintenanceCommand::RunDue);

    let heartbeat = tokio::spawn(heartbeat::run_heartbeat(ctx.clone(), ctx.cancel.clone()));
    let listener = router::run_listener(ctx.clone(), surface.clone());
    let result = listener.await;

    if let Some(filter) = filter {
        filter.stop();
    }
    let _ = heartbeat.await;
    result.map_err(MountError::Io)
}
