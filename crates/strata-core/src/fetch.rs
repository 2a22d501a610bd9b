//! Fetch coordination with per-chunk de-duplication.
//!
//! Every chunk being fetched from an origin has exactly one ticket in the
//! registry, keyed by `(dataset key, chunk index)`. A caller that needs a
//! chunk either creates the ticket (and becomes responsible for the origin
//! call) or attaches to the existing one and waits for its outcome.
//!
//! The origin call runs in its own task. A caller that goes away only
//! drops its receiver; the fetch still completes and lands in the store.
//!
//! Ordering on completion: write to the store, remove the ticket, then
//! broadcast. A caller that misses the ticket therefore always finds the
//! chunk in the store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};

use strata_config::{log_fetch_debug, log_fetch_warn, FetchConfig};
use strata_meta::DatasetId;
use strata_origin::{contiguous_runs, ChunkBatch, OriginClient, OriginError};
use strata_store::ChunkStore;

use crate::error::{ChunkError, Result};
use crate::planner::partition;

/// How a delivered chunk was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// Already in the store for the current epoch
    Cached,
    /// Fetched from the origin for this request (or a concurrent one)
    Fetched,
    /// Origin unavailable; an older blob was kept and served
    Stale,
}

pub type ChunkOutcome = std::result::Result<ChunkStatus, ChunkError>;

type TicketKey = (String, u64);
type Tickets = DashMap<TicketKey, broadcast::Sender<ChunkOutcome>>;

/// Removes a fetch's tickets that were never resolved (task panic or abort).
/// Waiters then see a closed channel.
struct TicketGuard {
    tickets: Arc<Tickets>,
    keys: Vec<TicketKey>,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            self.tickets.remove(&key);
        }
    }
}

/// Executes fetch plans against an origin, writing results to the store.
#[derive(Clone)]
pub struct FetchCoordinator {
    store: ChunkStore,
    origin: Arc<dyn OriginClient>,
    tickets: Arc<Tickets>,
    limiter: Arc<Semaphore>,
    config: FetchConfig,
}

impl FetchCoordinator {
    pub fn new(store: ChunkStore, origin: Arc<dyn OriginClient>, config: FetchConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            store,
            origin,
            tickets: Arc::new(DashMap::new()),
            limiter: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    /// Number of fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.tickets.len()
    }

    /// Make the given chunks available for `epoch`.
    ///
    /// Returns one outcome per distinct requested index. `Err` only for
    /// local store failures while partitioning; origin failures are
    /// reported per index. A chunk delivered by a fetch that was issued
    /// before `epoch` began is reported `Stale`.
    pub async fn ensure(
        &self,
        id: &DatasetId,
        epoch: DateTime<Utc>,
        indices: &[u64],
    ) -> Result<BTreeMap<u64, ChunkOutcome>> {
        let key = id.storage_key();
        let unique: Vec<u64> = indices.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let split = partition(&self.store, &key, epoch, &unique)?;

        let mut outcomes: BTreeMap<u64, ChunkOutcome> = split
            .present
            .iter()
            .map(|&idx| (idx, Ok(ChunkStatus::Cached)))
            .collect();

        let mut waiters = Vec::new();
        let mut owned = Vec::new();
        for idx in split.missing {
            let ticket_key = (key.clone(), idx);
            let rx = match self.tickets.entry(ticket_key.clone()) {
                Entry::Occupied(existing) => {
                    log_fetch_debug!("Attaching to in-flight fetch", chunk = idx);
                    existing.get().subscribe()
                }
                Entry::Vacant(slot) => {
                    let (tx, rx) = broadcast::channel(1);
                    slot.insert(tx);
                    owned.push(idx);
                    rx
                }
            };
            waiters.push((idx, rx));
        }

        // A fetch may have landed between partitioning and ticket creation.
        let mut to_fetch = Vec::with_capacity(owned.len());
        for idx in owned {
            match self.store.has(&key, idx, epoch) {
                Ok(false) => to_fetch.push(idx),
                Ok(true) => self.resolve_ticket(&(key.clone(), idx), Ok(ChunkStatus::Cached)),
                Err(e) => self.resolve_ticket(
                    &(key.clone(), idx),
                    Err(ChunkError::Store(e.to_string())),
                ),
            }
        }

        if !to_fetch.is_empty() {
            let this = self.clone();
            let id = id.clone();
            let guard = TicketGuard {
                tickets: Arc::clone(&self.tickets),
                keys: to_fetch.iter().map(|&idx| (key.clone(), idx)).collect(),
            };
            tokio::spawn(async move {
                this.run_fetch(id, to_fetch, guard).await;
            });
        }

        let received = join_all(waiters.into_iter().map(|(idx, mut rx)| async move {
            let outcome = rx.recv().await.unwrap_or(Err(ChunkError::Abandoned));
            (idx, outcome)
        }))
        .await;
        for (idx, outcome) in received {
            let outcome = match outcome {
                Ok(ChunkStatus::Fetched) if matches!(self.store.has(&key, idx, epoch), Ok(false)) => {
                    log_fetch_debug!("Attached fetch predates epoch", chunk = idx);
                    Ok(ChunkStatus::Stale)
                }
                other => other,
            };
            outcomes.insert(idx, outcome);
        }
        Ok(outcomes)
    }

    fn resolve_ticket(&self, key: &TicketKey, outcome: ChunkOutcome) {
        if let Some((_, tx)) = self.tickets.remove(key) {
            // No receivers left is fine: every waiter was cancelled.
            let _ = tx.send(outcome);
        }
    }

    async fn run_fetch(&self, id: DatasetId, indices: Vec<u64>, mut guard: TicketGuard) {
        let key = id.storage_key();
        let (issued_at, mut results) = self.fetch_with_retries(&id, &indices).await;

        while let Some(ticket) = guard.keys.last().cloned() {
            let idx = ticket.1;
            let outcome = match results.remove(&idx) {
                Some(Ok(bytes)) => self.write_chunk(&key, idx, bytes, issued_at).await,
                Some(Err(e)) => self.fallback(&key, idx, e),
                None => Err(ChunkError::Missing),
            };
            if let Err(e) = &outcome {
                log_fetch_warn!(
                    "Chunk fetch failed",
                    dataset = tracing::field::display(&id),
                    chunk = idx,
                    error = tracing::field::display(e),
                );
            }
            self.resolve_ticket(&ticket, outcome);
            guard.keys.pop();
        }

        let store = self.store.clone();
        let flushed = tokio::task::spawn_blocking(move || {
            store.flush(&key).map_err(|e| e.to_string())
        })
        .await;
        if let Err(e) = flushed.map_err(|e| e.to_string()).and_then(|r| r) {
            log_fetch_warn!(
                "Presence bitmap flush failed",
                dataset = tracing::field::display(&id),
                error = e.as_str(),
            );
        }
    }

    /// Write a fetched chunk on the blocking pool (fsync and rename).
    async fn write_chunk(
        &self,
        key: &str,
        idx: u64,
        bytes: Vec<u8>,
        fetched_at: DateTime<Utc>,
    ) -> ChunkOutcome {
        let store = self.store.clone();
        let key = key.to_string();
        match tokio::task::spawn_blocking(move || store.write(&key, idx, &bytes, fetched_at)).await {
            Ok(Ok(())) => Ok(ChunkStatus::Fetched),
            Ok(Err(e)) => Err(ChunkError::Store(e.to_string())),
            Err(e) => Err(ChunkError::Store(e.to_string())),
        }
    }

    /// Serve an older blob when the origin is unavailable.
    fn fallback(&self, key: &str, idx: u64, err: OriginError) -> ChunkOutcome {
        if err.is_unavailable() && matches!(self.store.is_present(key, idx), Ok(true)) {
            log_fetch_debug!("Serving stale chunk", chunk = idx);
            return Ok(ChunkStatus::Stale);
        }
        Err(ChunkError::Origin(err))
    }

    /// Call the origin, retrying unavailable indices that have no older
    /// blob to fall back on.
    ///
    /// Returns the time the first call was issued (recorded as the chunks'
    /// `fetched_at`) and the per-index result.
    async fn fetch_with_retries(
        &self,
        id: &DatasetId,
        indices: &[u64],
    ) -> (DateTime<Utc>, BTreeMap<u64, std::result::Result<Vec<u8>, OriginError>>) {
        let key = id.storage_key();
        let issued_at = Utc::now();
        let mut results = BTreeMap::new();
        let mut pending = indices.to_vec();
        let mut attempt = 0u32;

        loop {
            let mut batch = self.call_origin(id, &pending).await;
            let mut retry = Vec::new();
            for idx in pending {
                match batch.take(idx) {
                    Some(Err(e))
                        if e.is_unavailable()
                            && attempt < self.config.retries
                            && !matches!(self.store.is_present(&key, idx), Ok(true)) =>
                    {
                        retry.push(idx);
                    }
                    Some(result) => {
                        results.insert(idx, result);
                    }
                    None => {}
                }
            }

            if retry.is_empty() {
                return (issued_at, results);
            }
            attempt += 1;
            let delay = self
                .config
                .retry_backoff()
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            log_fetch_debug!(
                "Retrying unavailable chunks",
                dataset = tracing::field::display(id),
                count = retry.len(),
                attempt = attempt,
            );
            tokio::time::sleep(delay).await;
            pending = retry;
        }
    }

    /// One origin call per contiguous run of indices, run concurrently.
    ///
    /// Each call holds one limiter permit, so `max_concurrent` bounds the
    /// requests open against the origin.
    async fn call_origin(&self, id: &DatasetId, indices: &[u64]) -> ChunkBatch {
        let batches = join_all(
            contiguous_runs(indices)
                .into_iter()
                .map(|(start, end)| self.call_run(id, (start..end).collect())),
        )
        .await;

        let mut merged = ChunkBatch::default();
        for batch in batches {
            merged.chunks.extend(batch.chunks);
            merged.errors.extend(batch.errors);
        }
        merged
    }

    /// One bounded, timed origin call. Whole-call failures are spread over
    /// every index of the run.
    async fn call_run(&self, id: &DatasetId, indices: Vec<u64>) -> ChunkBatch {
        let result = match self.limiter.acquire().await {
            Ok(_permit) => {
                log_fetch_debug!(
                    "Fetching chunks from origin",
                    dataset = tracing::field::display(id),
                    count = indices.len(),
                );
                match tokio::time::timeout(self.config.timeout(), self.origin.get_chunks(id, &indices))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(OriginError::Timeout),
                }
            }
            Err(_) => Err(OriginError::Unreachable("fetch limiter closed".to_string())),
        };

        match result {
            Ok(batch) => batch,
            Err(e) => {
                match &e {
                    OriginError::Timeout => log_fetch_warn!(
                        "Origin timed out",
                        dataset = tracing::field::display(id),
                        count = indices.len(),
                    ),
                    OriginError::Unreachable(_) => log_fetch_warn!(
                        "Origin unreachable",
                        dataset = tracing::field::display(id),
                        error = tracing::field::display(&e),
                    ),
                    _ => {}
                }
                ChunkBatch {
                    chunks: BTreeMap::new(),
                    errors: indices.iter().map(|&idx| (idx, e.clone())).collect(),
                }
            }
        }
    }
}
