//! Background object cache.
//!
//! Single-flight: concurrent `ensure` calls for one OID share one
//! fetch. Misses landing within the batch window coalesce into a
//! single packfile request; a lone miss downloads as a loose object.
//! The in-flight map's mutex is held only around map mutation, never
//! across I/O.
//!
//! Waiter tracking backs cancellation: when every waiter for an OID has
//! dropped, the flight's token cancels and the fetch aborts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use phantom_fetch::{FetchError, ObjectRequester};
use phantom_odb::store::PackedObject;
use phantom_odb::{ObjectStore, ObjectType, Oid};

use crate::blob_sizes::BlobSizes;
use crate::counters::ActivityCounters;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The fetch seam: production code hands in the HTTP requester, tests
/// substitute canned sources.
pub trait ObjectFetcher: Send + Sync {
    fn fetch_loose<'a>(
        &'a self,
        oid_hex: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, phantom_fetch::Result<Vec<u8>>>;

    fn fetch_pack<'a>(
        &'a self,
        oids: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, phantom_fetch::Result<Vec<u8>>>;
}

impl ObjectFetcher for ObjectRequester {
    fn fetch_loose<'a>(
        &'a self,
        oid_hex: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, phantom_fetch::Result<Vec<u8>>> {
        Box::pin(self.download_loose(oid_hex, cancel))
    }

    fn fetch_pack<'a>(
        &'a self,
        oids: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, phantom_fetch::Result<Vec<u8>>> {
        Box::pin(self.download_pack(oids, true, cancel))
    }
}

/// Cloneable so one outcome fans out to every waiter.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("object store rejected download: {detail}")]
    Store { detail: String },

    #[error("object {oid} missing from downloaded pack")]
    MissingFromPack { oid: Oid },

    #[error("object cache worker is gone")]
    WorkerGone,
}

type FlightResult = std::result::Result<(), CacheError>;

struct Flight {
    tx: watch::Sender<Option<FlightResult>>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

impl Flight {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            waiters: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        }
    }
}

/// Decrements the waiter count on drop; the last waiter out cancels
/// the flight.
struct WaiterGuard {
    flight: Arc<Flight>,
}

impl WaiterGuard {
    fn join(flight: Arc<Flight>) -> Self {
        flight.waiters.fetch_add(1, Ordering::SeqCst);
        Self { flight }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.flight.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.flight.cancel.cancel();
        }
    }
}

struct CacheInner {
    odb: Arc<ObjectStore>,
    blob_sizes: Arc<BlobSizes>,
    counters: Arc<ActivityCounters>,
    fetcher: Arc<dyn ObjectFetcher>,
    inflight: Mutex<HashMap<Oid, Arc<Flight>>>,
    queue_tx: mpsc::UnboundedSender<Oid>,
}

/// Handle to the cache; clones share state.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<CacheInner>,
}

impl ObjectCache {
    /// Builds the cache and spawns its worker task.
    pub fn spawn(
        odb: Arc<ObjectStore>,
        blob_sizes: Arc<BlobSizes>,
        counters: Arc<ActivityCounters>,
        fetcher: Arc<dyn ObjectFetcher>,
        batch_window: Duration,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CacheInner {
            odb,
            blob_sizes,
            counters,
            fetcher,
            inflight: Mutex::new(HashMap::new()),
            queue_tx,
        });
        let worker_inner = inner.clone();
        let handle = tokio::spawn(async move {
            run_worker(worker_inner, queue_rx, batch_window, shutdown).await;
        });
        (Self { inner }, handle)
    }

    /// Makes `oid` present in the object store, coalescing with any
    /// other in-flight request for it.
    pub async fn ensure(&self, oid: Oid) -> FlightResult {
        if self.inner.odb.has_object(&oid) {
            return Ok(());
        }

        let flight = {
            let mut map = self.inner.inflight.lock();
            match map.get(&oid) {
                Some(flight) => flight.clone(),
                None => {
                    let flight = Arc::new(Flight::new());
                    map.insert(oid, flight.clone());
                    ActivityCounters::bump(&self.inner.counters.background_ops);
                    if self.inner.queue_tx.send(oid).is_err() {
                        map.remove(&oid);
                        return Err(CacheError::WorkerGone);
                    }
                    flight
                }
            }
        };

        let _guard = WaiterGuard::join(flight.clone());
        let mut rx = flight.tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::WorkerGone);
            }
        }
    }

    /// Downloads one packfile covering `commits` and indexes it.
    /// Used by the Prefetch verb; not single-flighted.
    pub async fn prefetch(
        &self,
        commits: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<PackedObject>, CacheError> {
        let bytes = self.inner.fetcher.fetch_pack(commits, cancel).await?;
        ActivityCounters::add(&self.inner.counters.bytes_downloaded, bytes.len() as u64);
        let objects = self
            .inner
            .odb
            .write_pack(&bytes)
            .map_err(|e| CacheError::Store {
                detail: e.to_string(),
            })?;
        self.prime_sizes(&objects);
        ActivityCounters::add(
            &self.inner.counters.objects_fetched,
            objects.len() as u64,
        );
        Ok(objects)
    }

    fn prime_sizes(&self, objects: &[PackedObject]) {
        let blobs = objects
            .iter()
            .filter(|o| o.object_type == ObjectType::Blob)
            .map(|o| (o.oid, o.size));
        if let Err(e) = self.inner.blob_sizes.put_many(blobs) {
            warn!(error = %e, "failed to prime blob sizes");
        }
    }
}

async fn run_worker(
    inner: Arc<CacheInner>,
    mut queue_rx: mpsc::UnboundedReceiver<Oid>,
    batch_window: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            oid = queue_rx.recv() => match oid {
                Some(oid) => oid,
                None => break,
            },
        };

        // Collect everything that misses within the window.
        let mut batch = vec![first];
        let deadline = tokio::time::sleep(batch_window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = shutdown.cancelled() => break,
                oid = queue_rx.recv() => match oid {
                    Some(oid) => batch.push(oid),
                    None => break,
                },
            }
        }

        let flights: Vec<(Oid, Arc<Flight>)> = {
            let map = inner.inflight.lock();
            batch
                .iter()
                .filter_map(|oid| map.get(oid).map(|f| (*oid, f.clone())))
                .collect()
        };

        // Flights whose waiters all left are aborted, not fetched; an
        // object that landed meanwhile (say via a prefetch pack) is
        // already a success.
        let mut live = Vec::with_capacity(flights.len());
        for (oid, flight) in flights {
            if flight.cancel.is_cancelled() {
                complete(&inner, oid, &flight, Err(CacheError::Fetch(FetchError::Cancelled)));
            } else if inner.odb.has_object(&oid) {
                complete(&inner, oid, &flight, Ok(()));
            } else {
                live.push((oid, flight));
            }
        }
        if live.is_empty() {
            continue;
        }

        ActivityCounters::add(&inner.counters.fetches_inflight, live.len() as u64);
        if live.len() == 1 {
            let (oid, flight) = live.remove(0);
            fetch_single(&inner, oid, flight).await;
        } else {
            fetch_batch(&inner, live, &shutdown).await;
        }
        inner.counters.fetches_inflight.store(0, Ordering::Relaxed);
    }
    debug!("object cache worker stopped");
}

async fn fetch_single(inner: &Arc<CacheInner>, oid: Oid, flight: Arc<Flight>) {
    let hex = oid.to_hex();
    let result = inner.fetcher.fetch_loose(&hex, &flight.cancel).await;
    let outcome = match result {
        Ok(bytes) => {
            ActivityCounters::add(&inner.counters.bytes_downloaded, bytes.len() as u64);
            match inner.odb.write_loose(&oid, &bytes) {
                Ok((object_type, size)) => {
                    if object_type == ObjectType::Blob {
                        if let Err(e) = inner.blob_sizes.put(&oid, size) {
                            warn!(error = %e, "failed to record blob size");
                        }
                    }
                    ActivityCounters::bump(&inner.counters.objects_fetched);
                    Ok(())
                }
                Err(e) => Err(CacheError::Store {
                    detail: e.to_string(),
                }),
            }
        }
        Err(e) => Err(CacheError::Fetch(e)),
    };
    complete(inner, oid, &flight, outcome);
}

async fn fetch_batch(
    inner: &Arc<CacheInner>,
    flights: Vec<(Oid, Arc<Flight>)>,
    shutdown: &CancellationToken,
) {
    let hexes: Vec<String> = flights.iter().map(|(oid, _)| oid.to_hex()).collect();
    debug!(count = hexes.len(), "coalescing misses into one pack request");

    // The batch aborts only when every member flight has lost its
    // waiters (or the mount is shutting down).
    let batch_cancel = shutdown.child_token();
    {
        let tokens: Vec<CancellationToken> =
            flights.iter().map(|(_, f)| f.cancel.clone()).collect();
        let batch_cancel = batch_cancel.clone();
        tokio::spawn(async move {
            for token in tokens {
                token.cancelled().await;
            }
            batch_cancel.cancel();
        });
    }

    match inner.fetcher.fetch_pack(&hexes, &batch_cancel).await {
        Ok(bytes) => {
            ActivityCounters::add(&inner.counters.bytes_downloaded, bytes.len() as u64);
            match inner.odb.write_pack(&bytes) {
                Ok(objects) => {
                    let blobs = objects
                        .iter()
                        .filter(|o| o.object_type == ObjectType::Blob)
                        .map(|o| (o.oid, o.size));
                    if let Err(e) = inner.blob_sizes.put_many(blobs) {
                        warn!(error = %e, "failed to prime blob sizes");
                    }
                    ActivityCounters::add(
                        &inner.counters.objects_fetched,
                        objects.len() as u64,
                    );
                    for (oid, flight) in flights {
                        let outcome = if inner.odb.has_object(&oid) {
                            Ok(())
                        } else {
                            Err(CacheError::MissingFromPack { oid })
                        };
                        complete(inner, oid, &flight, outcome);
                    }
                }
                Err(e) => {
                    let error = CacheError::Store {
                        detail: e.to_string(),
                    };
                    for (oid, flight) in flights {
                        complete(inner, oid, &flight, Err(error.clone()));
                    }
                }
            }
        }
        Err(e) => {
            for (oid, flight) in flights {
                complete(inner, oid, &flight, Err(CacheError::Fetch(e.clone())));
            }
        }
    }
}

fn complete(inner: &Arc<CacheInner>, oid: Oid, flight: &Arc<Flight>, result: FlightResult) {
    inner.inflight.lock().remove(&oid);
    let count = &inner.counters.background_ops;
    let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    let _ = flight.tx.send(Some(result));
}
