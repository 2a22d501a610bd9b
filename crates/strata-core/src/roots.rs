//! Root subscriptions and dataset listings.
//!
//! A root with no record is unknown. `subscribe` writes a `Subscribing`
//! record, validates the root against its origin, and either promotes it
//! to `Subscribed` or removes the record again. Once subscribed, a root
//! stays subscribed through origin outages and serves its last listing.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use strata_config::{log_roots_info, log_roots_warn, OriginConfig, RootsConfig};
use strata_meta::{MetaCache, RootRecord, RootScope, RootState};
use strata_origin::OriginClient;

use crate::error::{CoreError, Result};

/// Summary of a root, known from configuration or a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSummary {
    pub name: String,
    pub subscribed: bool,
    pub scope: RootScope,
}

/// Tracks subscribed roots and their dataset listings.
#[derive(Clone)]
pub struct RootTracker {
    meta: MetaCache,
    origin: Arc<dyn OriginClient>,
    origins: Vec<OriginConfig>,
    config: RootsConfig,
}

impl RootTracker {
    pub fn new(
        meta: MetaCache,
        origin: Arc<dyn OriginClient>,
        origins: Vec<OriginConfig>,
        config: RootsConfig,
    ) -> Self {
        Self {
            meta,
            origin,
            origins,
            config,
        }
    }

    /// Subscribe to a configured root. Idempotent for subscribed roots.
    pub async fn subscribe(&self, root: &str) -> Result<()> {
        if self.is_subscribed(root)? {
            return Ok(());
        }
        let address = strata_config::origin_url(&self.origins, root)
            .ok_or_else(|| CoreError::NotFound(format!("no origin configured for root {}", root)))?;

        let mut record = RootRecord::new(root, address);
        self.meta.put_root(&record)?;

        match self.origin.list_datasets(root).await {
            Ok(listing) => {
                record.state = RootState::Subscribed;
                record.listed_at = Some(Utc::now());
                record.last_listing = listing;
                self.meta.put_root(&record)?;
                log_roots_info!(
                    "Subscribed to root",
                    root = root,
                    datasets = record.last_listing.len(),
                );
                Ok(())
            }
            Err(e) => {
                self.meta.remove_root(root)?;
                log_roots_warn!(
                    "Subscription failed",
                    root = root,
                    error = tracing::field::display(&e),
                );
                Err(CoreError::from_origin(e, root))
            }
        }
    }

    /// Forget a root. Cached datasets stay until purged.
    pub fn unsubscribe(&self, root: &str) -> Result<bool> {
        let removed = self.meta.remove_root(root)?;
        if removed {
            log_roots_info!("Unsubscribed from root", root = root);
        }
        Ok(removed)
    }

    pub fn is_subscribed(&self, root: &str) -> Result<bool> {
        Ok(self
            .meta
            .get_root(root)?
            .is_some_and(|record| record.subscribed()))
    }

    /// Dataset paths of a subscribed root.
    ///
    /// Served from the last listing unless it is older than the refresh
    /// interval or a change was notified. A failed refresh serves the old
    /// listing.
    pub async fn list(&self, root: &str) -> Result<Vec<String>> {
        let record = self.subscribed_record(root)?;

        let expired = match record.listed_at {
            Some(at) => {
                let age = Utc::now() - at;
                age.to_std().map_or(false, |age| age >= self.config.refresh_interval())
            }
            None => true,
        };
        if !expired && !record.needs_refresh {
            return Ok(record.last_listing);
        }

        match self.resync(root).await {
            Ok(listing) => Ok(listing),
            Err(e) => {
                log_roots_warn!(
                    "Listing refresh failed, serving last listing",
                    root = root,
                    error = tracing::field::display(&e),
                );
                Ok(record.last_listing)
            }
        }
    }

    /// Re-list a root from its origin and reconcile cached datasets.
    ///
    /// Datasets missing from the new listing are marked deleted; ones that
    /// reappear are restored.
    pub async fn resync(&self, root: &str) -> Result<Vec<String>> {
        let mut record = self.subscribed_record(root)?;
        let listing = self
            .origin
            .list_datasets(root)
            .await
            .map_err(|e| CoreError::from_origin(e, root))?;

        let listed: BTreeSet<String> = listing
            .iter()
            .map(|p| strata_config::path::normalize_dataset_path(p))
            .collect();
        let mut deleted = 0usize;
        for (id, meta) in self.meta.datasets_in_root(root)? {
            let present = listed.contains(&id.path);
            if meta.deleted == present {
                self.meta.set_deleted(&id, !present)?;
                if !present {
                    deleted += 1;
                }
            }
        }

        record.last_listing = listing.clone();
        record.listed_at = Some(Utc::now());
        record.needs_refresh = false;
        self.meta.put_root(&record)?;

        log_roots_info!(
            "Resynced root",
            root = root,
            datasets = listing.len(),
            newly_deleted = deleted,
        );
        Ok(listing)
    }

    /// Mark a root's listing as changed. Returns false for unknown roots.
    pub fn notify(&self, root: &str) -> Result<bool> {
        let Some(mut record) = self.meta.get_root(root)? else {
            return Ok(false);
        };
        record.needs_refresh = true;
        self.meta.put_root(&record)?;
        Ok(true)
    }

    /// Names of subscribed roots, ordered
    pub fn subscribed_roots(&self) -> Result<Vec<String>> {
        Ok(self
            .meta
            .roots()?
            .into_iter()
            .filter(RootRecord::subscribed)
            .map(|r| r.name)
            .collect())
    }

    /// Every configured or subscribed root, ordered by name.
    pub fn list_roots(&self) -> Result<Vec<RootSummary>> {
        let subscribed: BTreeSet<String> = self.subscribed_roots()?.into_iter().collect();
        let mut names: BTreeSet<String> = self.origins.iter().map(|o| o.name.clone()).collect();
        names.extend(subscribed.iter().cloned());

        Ok(names
            .into_iter()
            .map(|name| RootSummary {
                subscribed: subscribed.contains(&name),
                scope: RootScope::of(&name),
                name,
            })
            .collect())
    }

    fn subscribed_record(&self, root: &str) -> Result<RootRecord> {
        match self.meta.get_root(root)? {
            Some(record) if record.subscribed() => Ok(record),
            _ => Err(CoreError::NotFound(format!("root {} is not subscribed", root))),
        }
    }
}
