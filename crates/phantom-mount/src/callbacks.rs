//! The virtualization callback surface.
//!
//! The kernel filter serializes callbacks per path and runs different
//! paths in parallel; this surface is reentrant across paths and only
//! blocks inside hydration (object download is synchronous within
//! get-file-stream, the hydration point).
//!
//! Placeholder state transitions:
//! ```text
//! Virtual ── get_placeholder_info ──► Partial ── get_file_stream ok ──► Full
//! Partial ── get_file_stream err ──► Partial (driver reports I/O error)
//! Full    ── notify_file_modified ──► Modified (journal append)
//! any     ── notify_file_deleted  ──► Tombstone (journal append)
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use phantom_index::{DirectoryListing, EntryMode};
use phantom_lock::DeferredAction;
use phantom_odb::Oid;

use crate::counters::ActivityCounters;
use crate::state::MountState;
use crate::MountContext;

/// Bytes per chunk handed to the driver's sink.
const STREAM_CHUNK: usize = 64 * 1024;

/// Driver-visible failures. Everything non-fatal folds into `Io`,
/// which the driver reports as an I/O error on the user's handle.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("path not found")]
    NotFound,

    #[error("mount is not ready")]
    NotReady,

    #[error("access denied")]
    AccessDenied,

    #[error("I/O failure: {0}")]
    Io(String),
}

/// Per-mount placeholder state. Dies with the process; the kernel
/// filter owns the durable notion of what is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderState {
    Virtual,
    Partial,
    Full,
    Modified,
    Tombstone,
}

/// Answer for get-placeholder-info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub mode: EntryMode,
    pub size: u64,
    pub oid: Option<Oid>,
}

/// Where get-file-stream writes. The driver supplies its own sink;
/// tests use a `Vec<u8>`.
pub trait ContentSink: Send {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

impl ContentSink for Vec<u8> {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// The surface the kernel filter calls into.
pub struct VirtualizationSurface {
    ctx: Arc<MountContext>,
    states: DashMap<String, PlaceholderState>,
}

impl VirtualizationSurface {
    pub fn new(ctx: Arc<MountContext>) -> Self {
        Self {
            ctx,
            states: DashMap::new(),
        }
    }

    fn ready(&self) -> Result<(), CallbackError> {
        if self.ctx.state.get() != MountState::Ready {
            return Err(CallbackError::NotReady);
        }
        ActivityCounters::bump(&self.ctx.counters.callbacks_served);
        Ok(())
    }

    /// Current placeholder state for a path (`Virtual` when untracked).
    pub fn state_of(&self, path: &str) -> PlaceholderState {
        self.states
            .get(path)
            .map(|s| *s)
            .unwrap_or(PlaceholderState::Virtual)
    }

    /// EnumerateDirectory: projection minus tombstones, with modified
    /// entries re-stat'd from disk.
    pub fn enumerate_directory(&self, dir: &str) -> Result<DirectoryListing, CallbackError> {
        self.ready()?;
        self.ctx
            .projector
            .list_directory(dir, &self.ctx.journal, &self.ctx.layout.worktree())
            .ok_or(CallbackError::NotFound)
    }

    /// GetPlaceholderInfo: metadata for one projected path. Sizes come
    /// from the blob-sizes cache; a cold miss hydrates the object once
    /// and records its size for next time.
    pub async fn get_placeholder_info(
        &self,
        path: &str,
    ) -> Result<PlaceholderInfo, CallbackError> {
        self.ready()?;
        if self.ctx.journal.is_tombstoned(path) {
            return Err(CallbackError::NotFound);
        }

        let Some(entry) = self.ctx.projector.entry_for(path) else {
            // Absent from projection: answer from disk only when the
            // journal says the user put something there.
            if self.ctx.journal.is_modified(path) {
                return self.on_disk_info(path);
            }
            return Err(CallbackError::NotFound);
        };

        let size = match entry.mode {
            EntryMode::Subtree | EntryMode::Submodule => 0,
            _ => self.blob_size(&entry.oid).await?,
        };

        self.states
            .entry(path.to_string())
            .or_insert(PlaceholderState::Partial);
        Ok(PlaceholderInfo {
            mode: entry.mode,
            size,
            oid: Some(entry.oid),
        })
    }

    fn on_disk_info(&self, path: &str) -> Result<PlaceholderInfo, CallbackError> {
        let meta = std::fs::symlink_metadata(self.ctx.layout.worktree().join(path))
            .map_err(|_| CallbackError::NotFound)?;
        let mode = if meta.is_dir() {
            EntryMode::Subtree
        } else if meta.file_type().is_symlink() {
            EntryMode::Symlink
        } else {
            EntryMode::Regular
        };
        Ok(PlaceholderInfo {
            mode,
            size: if meta.is_dir() { 0 } else { meta.len() },
            oid: None,
        })
    }

    async fn blob_size(&self, oid: &Oid) -> Result<u64, CallbackError> {
        if let Ok(Some(size)) = self.ctx.blob_sizes.get(oid) {
            return Ok(size);
        }
        // Cold path: hydrate once, record, answer.
        self.ctx
            .cache
            .ensure(*oid)
            .await
            .map_err(|e| CallbackError::Io(e.to_string()))?;
        let (_, payload) = self
            .ctx
            .odb
            .read_object(oid)
            .map_err(|e| CallbackError::Io(e.to_string()))?;
        let size = payload.len() as u64;
        if let Err(e) = self.ctx.blob_sizes.put(oid, size) {
            warn!(oid = %oid, error = %e, "failed to record blob size");
        }
        Ok(size)
    }

    /// GetFileStream: hydrate and stream `[offset, offset+length)` of
    /// the projected content. Returns the bytes written.
    ///
    /// A failed hydration leaves the path `Partial` so the driver can
    /// retry; a corrupt object fails this request but not the mount.
    pub async fn get_file_stream(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        sink: &mut dyn ContentSink,
    ) -> Result<u64, CallbackError> {
        self.ready()?;
        let entry = self
            .ctx
            .projector
            .entry_for(path)
            .ok_or(CallbackError::NotFound)?;

        self.ctx.cache.ensure(entry.oid).await.map_err(|e| {
            debug!(path, oid = %entry.oid, error = %e, "hydration failed");
            CallbackError::Io(e.to_string())
        })?;

        let (_, payload) = self.ctx.odb.read_object(&entry.oid).map_err(|e| {
            error!(path, oid = %entry.oid, error = %e, "object unreadable after hydration");
            CallbackError::Io(e.to_string())
        })?;

        let start = (offset as usize).min(payload.len());
        let end = offset
            .saturating_add(length)
            .min(payload.len() as u64) as usize;
        let mut written = 0u64;
        for chunk in payload[start..end].chunks(STREAM_CHUNK) {
            sink.write(chunk)
                .map_err(|e| CallbackError::Io(e.to_string()))?;
            written += chunk.len() as u64;
        }

        self.states
            .insert(path.to_string(), PlaceholderState::Full);
        debug!(path, oid = %entry.oid, written, "hydrated");
        Ok(written)
    }

    /// NotifyNewFile: the user created something the projection never
    /// knew about.
    pub fn notify_new_file(&self, path: &str, is_folder: bool) -> Result<(), CallbackError> {
        self.ready()?;
        self.journal_modified(path, is_folder);
        self.states
            .insert(path.to_string(), PlaceholderState::Modified);
        Ok(())
    }

    /// NotifyFileModified: first write to a hydrated placeholder.
    pub fn notify_file_modified(&self, path: &str) -> Result<(), CallbackError> {
        self.ready()?;
        self.journal_modified(path, false);
        self.states
            .insert(path.to_string(), PlaceholderState::Modified);
        Ok(())
    }

    /// NotifyFileDeleted: records the tombstone.
    pub fn notify_file_deleted(&self, path: &str, _is_folder: bool) -> Result<(), CallbackError> {
        self.ready()?;
        match self.ctx.journal.record_tombstone(path) {
            Ok(true) => ActivityCounters::bump(&self.ctx.counters.journal_appends),
            Ok(false) => {}
            Err(e) => return Err(CallbackError::Io(e.to_string())),
        }
        self.states
            .insert(path.to_string(), PlaceholderState::Tombstone);
        Ok(())
    }

    /// NotifyRename: the source becomes a tombstone when it was
    /// projected; the destination is user content now.
    pub fn notify_renamed(
        &self,
        from: &str,
        to: &str,
        is_folder: bool,
    ) -> Result<(), CallbackError> {
        self.ready()?;
        if self.ctx.projector.entry_for(from).is_some() {
            self.notify_inner_tombstone(from)?;
        }
        self.journal_modified(to, is_folder);
        self.states
            .insert(to.to_string(), PlaceholderState::Modified);
        Ok(())
    }

    /// NotifyHardLink: the link target is user content now.
    pub fn notify_hardlink_created(&self, path: &str) -> Result<(), CallbackError> {
        self.ready()?;
        self.journal_modified(path, false);
        Ok(())
    }

    /// NotifyPreDelete: veto deletion of the virtualization root and
    /// the repository metadata.
    pub fn notify_pre_delete(&self, path: &str) -> Result<(), CallbackError> {
        self.ready()?;
        if path.is_empty() || path == ".git" || path.starts_with(".git/") {
            info!(path, "denied delete of protected path");
            return Err(CallbackError::AccessDenied);
        }
        Ok(())
    }

    /// A checkout overwrote a tombstoned path with fresh content; the
    /// only backward transition in the state machine.
    pub fn notify_checkout_overwrite(&self, path: &str) -> Result<(), CallbackError> {
        self.ready()?;
        match self.ctx.journal.clear_tombstone(path) {
            Ok(true) => ActivityCounters::bump(&self.ctx.counters.journal_appends),
            Ok(false) => {}
            Err(e) => return Err(CallbackError::Io(e.to_string())),
        }
        self.states
            .insert(path.to_string(), PlaceholderState::Full);
        Ok(())
    }

    fn notify_inner_tombstone(&self, path: &str) -> Result<(), CallbackError> {
        match self.ctx.journal.record_tombstone(path) {
            Ok(true) => ActivityCounters::bump(&self.ctx.counters.journal_appends),
            Ok(false) => {}
            Err(e) => return Err(CallbackError::Io(e.to_string())),
        }
        self.states
            .insert(path.to_string(), PlaceholderState::Tombstone);
        Ok(())
    }

    fn journal_modified(&self, path: &str, is_folder: bool) {
        match self.ctx.journal.record_modified(path, is_folder) {
            Ok(true) => ActivityCounters::bump(&self.ctx.counters.journal_appends),
            Ok(false) => {}
            Err(e) => error!(path, error = %e, "journal append failed"),
        }
    }

    /// Drains the lock's deferred queue after an external command
    /// releases the working tree.
    pub fn process_deferred(&self) {
        for action in self.ctx.lock.drain_deferred() {
            match action {
                DeferredAction::InvalidateProjection => {
                    self.ctx.projector.invalidate();
                    if let Err(e) = self.ctx.projector.refresh_if_stale() {
                        error!(error = %e, "projection rebuild after lock release failed");
                    }
                }
                DeferredAction::RevisitPlaceholders => {
                    // The external command may have hydrated or replaced
                    // placeholders wholesale; our per-path memory is
                    // stale, the filter remains the source of truth.
                    self.states.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::RecordingGit;
    use crate::test_support::{scaffold_enlistment, IndexFile, MapFetcher};
    use phantom_index::ListingSource;
    use phantom_lock::LockToken;
    use phantom_odb::ObjectType;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"the answer is 42, hydrated on demand until it";

    fn harness(temp: &TempDir) -> (Arc<MountContext>, VirtualizationSurface, Oid) {
        let (fetcher, oids) = MapFetcher::new(&[PAYLOAD]);
        let git = Arc::new(RecordingGit::new());
        let index = [
            IndexFile {
                path: "a/b.txt",
                oid: oids[0],
                mode: 0o100644,
                skip_worktree: true,
            },
            IndexFile {
                path: "a/keep.txt",
                oid: Oid::from_bytes([0x11; 20]),
                mode: 0o100644,
                skip_worktree: true,
            },
            IndexFile {
                path: "top.txt",
                oid: Oid::from_bytes([0x22; 20]),
                mode: 0o100644,
                skip_worktree: true,
            },
        ];
        let options = scaffold_enlistment(temp.path(), &index, fetcher, git);
        let ctx = MountContext::bootstrap(options).unwrap();
        ctx.mark_ready();
        let surface = VirtualizationSurface::new(ctx.clone());
        (ctx, surface, oids[0])
    }

    #[tokio::test]
    async fn hydration_on_first_read() {
        // Projected file, object absent locally: one fetch, full bytes
        // to the sink, Partial → Full, no journal append.
        let temp = TempDir::new().unwrap();
        let (ctx, surface, oid) = harness(&temp);
        assert!(!ctx.odb.has_object(&oid));

        let info = surface.get_placeholder_info("a/b.txt").await.unwrap();
        assert_eq!(info.size, PAYLOAD.len() as u64);
        assert_eq!(surface.state_of("a/b.txt"), PlaceholderState::Partial);

        let mut sink = Vec::new();
        let written = surface
            .get_file_stream("a/b.txt", 0, PAYLOAD.len() as u64, &mut sink)
            .await
            .unwrap();

        assert_eq!(written, PAYLOAD.len() as u64);
        assert_eq!(sink, PAYLOAD);
        assert!(ctx.odb.has_object(&oid));
        assert_eq!(surface.state_of("a/b.txt"), PlaceholderState::Full);
        assert_eq!(ctx.journal.count(), 0);
    }

    #[tokio::test]
    async fn ranged_reads_respect_offset_and_length() {
        let temp = TempDir::new().unwrap();
        let (_ctx, surface, _oid) = harness(&temp);

        let mut sink = Vec::new();
        let written = surface
            .get_file_stream("a/b.txt", 4, 6, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 6);
        assert_eq!(sink, &PAYLOAD[4..10]);
    }

    #[tokio::test]
    async fn failed_hydration_leaves_path_partial() {
        let temp = TempDir::new().unwrap();
        let (_ctx, surface, _oid) = harness(&temp);

        // a/keep.txt's object is not served by the fetcher.
        surface.get_placeholder_info("a/keep.txt").await.unwrap_err();
        let mut sink = Vec::new();
        let err = surface
            .get_file_stream("a/keep.txt", 0, 10, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Io(_)));
        assert_ne!(surface.state_of("a/keep.txt"), PlaceholderState::Full);
    }

    #[tokio::test]
    async fn placeholder_info_misses_are_not_found() {
        let temp = TempDir::new().unwrap();
        let (_ctx, surface, _oid) = harness(&temp);
        let err = surface.get_placeholder_info("no/such/file").await.unwrap_err();
        assert!(matches!(err, CallbackError::NotFound));
    }

    #[tokio::test]
    async fn callbacks_fail_fast_when_not_ready() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, _oid) = harness(&temp);
        ctx.begin_unmount();

        assert!(matches!(
            surface.enumerate_directory(""),
            Err(CallbackError::NotReady)
        ));
        assert!(matches!(
            surface.get_placeholder_info("a/b.txt").await,
            Err(CallbackError::NotReady)
        ));
    }

    #[tokio::test]
    async fn deletes_tombstone_and_disappear_from_listings() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, _oid) = harness(&temp);

        surface.notify_file_deleted("top.txt", false).unwrap();
        assert_eq!(surface.state_of("top.txt"), PlaceholderState::Tombstone);
        assert!(ctx.journal.is_tombstoned("top.txt"));

        let listing = surface.enumerate_directory("").unwrap();
        assert!(listing.entries.iter().all(|e| e.name != "top.txt"));
    }

    #[tokio::test]
    async fn modified_files_stat_from_disk() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, _oid) = harness(&temp);

        let on_disk = ctx.layout.worktree().join("a/b.txt");
        std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        std::fs::write(&on_disk, b"user content").unwrap();
        surface.notify_file_modified("a/b.txt").unwrap();

        let listing = surface.enumerate_directory("a").unwrap();
        let entry = listing.entries.iter().find(|e| e.name == "b.txt").unwrap();
        assert_eq!(entry.source, ListingSource::OnDisk);
        assert_eq!(entry.size, Some(12));
        assert_eq!(surface.state_of("a/b.txt"), PlaceholderState::Modified);
    }

    #[tokio::test]
    async fn rename_tombstones_source_and_journals_destination() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, _oid) = harness(&temp);

        surface.notify_renamed("a/b.txt", "a/renamed.txt", false).unwrap();
        assert!(ctx.journal.is_tombstoned("a/b.txt"));
        assert!(ctx.journal.is_modified("a/renamed.txt"));
        assert_eq!(surface.state_of("a/renamed.txt"), PlaceholderState::Modified);
    }

    #[tokio::test]
    async fn pre_delete_protects_root_and_git_dir() {
        let temp = TempDir::new().unwrap();
        let (_ctx, surface, _oid) = harness(&temp);

        assert!(matches!(
            surface.notify_pre_delete(""),
            Err(CallbackError::AccessDenied)
        ));
        assert!(matches!(
            surface.notify_pre_delete(".git/config"),
            Err(CallbackError::AccessDenied)
        ));
        surface.notify_pre_delete("a/b.txt").unwrap();
    }

    #[tokio::test]
    async fn checkout_overwrite_revives_tombstone() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, _oid) = harness(&temp);

        surface.notify_file_deleted("a/b.txt", false).unwrap();
        surface.notify_checkout_overwrite("a/b.txt").unwrap();
        assert!(!ctx.journal.is_tombstoned("a/b.txt"));
        assert_eq!(surface.state_of("a/b.txt"), PlaceholderState::Full);
    }

    #[tokio::test]
    async fn deferred_actions_rebuild_projection_after_release() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, oid) = harness(&temp);

        // External command takes the lock and rewrites the index.
        let granted = ctx.lock.try_acquire_external(LockToken {
            pid: 99,
            name: "git checkout".to_string(),
            args: "git checkout topic".to_string(),
            check_only: false,
        });
        assert_eq!(granted, phantom_lock::AcquireOutcome::Granted);

        let new_index = crate::test_support::index_bytes(&[crate::test_support::IndexFile {
            path: "fresh.txt",
            oid,
            mode: 0o100644,
            skip_worktree: true,
        }]);
        std::fs::write(ctx.layout.git_index(), new_index).unwrap();

        assert!(ctx.lock.release_external(99));
        surface.process_deferred();

        assert!(ctx.projector.entry_for("fresh.txt").is_some());
        assert!(ctx.projector.entry_for("a/b.txt").is_none());
    }

    #[tokio::test]
    async fn blob_size_cache_answers_after_first_hydration() {
        let temp = TempDir::new().unwrap();
        let (ctx, surface, oid) = harness(&temp);

        surface.get_placeholder_info("a/b.txt").await.unwrap();
        assert_eq!(
            ctx.blob_sizes.get(&oid).unwrap(),
            Some(PAYLOAD.len() as u64)
        );

        // Loose object type survives the wire format round trip.
        let (object_type, payload) = ctx.odb.read_object(&oid).unwrap();
        assert_eq!(object_type, ObjectType::Blob);
        assert_eq!(payload, PAYLOAD);
    }
}
