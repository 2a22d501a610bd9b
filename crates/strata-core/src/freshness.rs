//! Freshness resolution for cached dataset metadata.
//!
//! The rule everywhere: a stale answer beats no answer. When the origin
//! cannot be reached, cached metadata is served as-is; only a cache miss
//! combined with an unreachable origin is an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_config::{log_origin_debug, log_origin_warn, FreshnessConfig};
use strata_meta::{DatasetId, DatasetMeta, MetaCache};
use strata_origin::{OriginClient, OriginError};
use strata_store::ChunkStore;

use crate::error::{CoreError, Result};

/// Outcome of a freshness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    Fresh,
    Stale,
    Unreachable,
}

/// Compare a probed origin mtime against the cached one.
///
/// Only an origin mtime more than `epsilon` ahead counts as a change.
pub fn classify(
    cached: DateTime<Utc>,
    probed: DateTime<Utc>,
    epsilon: std::time::Duration,
) -> Freshness {
    let epsilon = chrono::Duration::from_std(epsilon).unwrap_or(chrono::Duration::zero());
    if probed > cached + epsilon {
        Freshness::Stale
    } else {
        Freshness::Fresh
    }
}

/// Decides whether cached metadata can be trusted and refreshes it if not.
#[derive(Clone)]
pub struct FreshnessResolver {
    meta: MetaCache,
    store: ChunkStore,
    origin: Arc<dyn OriginClient>,
    config: FreshnessConfig,
}

impl FreshnessResolver {
    pub fn new(
        meta: MetaCache,
        store: ChunkStore,
        origin: Arc<dyn OriginClient>,
        config: FreshnessConfig,
    ) -> Self {
        Self {
            meta,
            store,
            origin,
            config,
        }
    }

    /// Probe the origin and classify the cached record.
    ///
    /// A record probed within the TTL is `Fresh` without a probe. A fresh
    /// probe updates the record's `origin_mtime`/`probed_at` but not its
    /// epoch.
    pub async fn check(&self, id: &DatasetId) -> Result<Freshness> {
        let Some(cached) = self.meta.get(id)? else {
            return Ok(Freshness::Stale);
        };
        self.check_cached(id, &cached).await
    }

    async fn check_cached(&self, id: &DatasetId, cached: &DatasetMeta) -> Result<Freshness> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl()).unwrap_or(chrono::Duration::zero());
        if !ttl.is_zero() && now - cached.probed_at < ttl {
            return Ok(Freshness::Fresh);
        }

        match self.origin.get_mtime(id).await {
            Ok(probed) => {
                let verdict = classify(cached.origin_mtime, probed, self.config.mtime_epsilon());
                if verdict == Freshness::Fresh {
                    self.meta.touch_mtime(id, probed, now)?;
                }
                log_origin_debug!(
                    "Probed origin mtime",
                    dataset = tracing::field::display(id),
                    stale = verdict == Freshness::Stale,
                );
                Ok(verdict)
            }
            // Gone at the origin: refetch to confirm.
            Err(OriginError::NotFound(_)) => Ok(Freshness::Stale),
            Err(OriginError::Timeout) => {
                log_origin_warn!("Freshness probe timed out", dataset = tracing::field::display(id));
                Ok(Freshness::Unreachable)
            }
            Err(e) => {
                log_origin_warn!(
                    "Freshness probe failed, origin unreachable",
                    dataset = tracing::field::display(id),
                    error = tracing::field::display(&e),
                );
                Ok(Freshness::Unreachable)
            }
        }
    }

    /// Return metadata a caller may use, refreshing it from the origin when stale.
    ///
    /// A refresh starts a new epoch (`cached_at = now`), which lazily
    /// invalidates every chunk fetched before it. If the refresh changes
    /// the chunk layout, the old chunks are dropped outright: their flat
    /// indices name different regions now and must never be served stale.
    pub async fn resolve(&self, id: &DatasetId) -> Result<DatasetMeta> {
        let cached = self.meta.get(id)?;
        if let Some(meta) = &cached {
            if meta.deleted {
                return Err(CoreError::NotFound(format!("{} was deleted at the origin", id)));
            }
        }

        let verdict = match &cached {
            Some(meta) => self.check_cached(id, meta).await?,
            None => Freshness::Stale,
        };

        match (verdict, cached) {
            (Freshness::Fresh, Some(meta)) => Ok(self.meta.get(id)?.unwrap_or(meta)),
            (Freshness::Unreachable, Some(meta)) => Ok(meta),
            (_, cached) => self.refresh(id, cached).await,
        }
    }

    async fn refresh(&self, id: &DatasetId, cached: Option<DatasetMeta>) -> Result<DatasetMeta> {
        match self.origin.get_meta(id).await {
            Ok(origin_meta) => {
                let meta = DatasetMeta::from_origin(origin_meta, Utc::now());
                meta.validate()
                    .map_err(|e| CoreError::InvalidMetadata(format!("{}: {}", id, e)))?;
                if cached.as_ref().is_some_and(|old| !old.same_layout(&meta)) {
                    log_origin_warn!(
                        "Chunk layout changed at origin, dropping cached chunks",
                        dataset = tracing::field::display(id),
                        shape = tracing::field::debug(&meta.shape),
                    );
                    self.store.remove_dataset(&id.storage_key())?;
                }
                self.meta.put(id, &meta)?;
                log_origin_debug!(
                    "Refreshed dataset metadata",
                    dataset = tracing::field::display(id),
                    chunks = meta.chunk_count(),
                );
                Ok(meta)
            }
            Err(OriginError::NotFound(what)) => {
                if cached.is_some() {
                    self.meta.set_deleted(id, true)?;
                }
                Err(CoreError::NotFound(what))
            }
            Err(e) if e.is_unavailable() => match cached {
                Some(meta) => {
                    log_origin_warn!(
                        "Metadata refresh failed, serving cached",
                        dataset = tracing::field::display(id),
                        error = tracing::field::display(&e),
                    );
                    Ok(meta)
                }
                None => Err(CoreError::from_origin(e, &id.to_string())),
            },
            Err(e) => Err(CoreError::from_origin(e, &id.to_string())),
        }
    }
}
