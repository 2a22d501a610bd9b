//! HTTP transport for publishers.
//!
//! Endpoints, relative to a root's configured base URL:
//!
//! | Request                                          | Response                |
//! |--------------------------------------------------|-------------------------|
//! | `GET roots/{root}/datasets`                      | JSON array of paths     |
//! | `GET roots/{root}/meta?path=P`                   | JSON `OriginMeta`       |
//! | `GET roots/{root}/mtime?path=P`                  | `{"mtime": RFC3339}`    |
//! | `GET roots/{root}/chunks?path=P&start=S&end=E`   | chunk frames for [S, E) |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use strata_config::{log_origin_debug, log_origin_warn, OriginConfig};
use strata_meta::{DatasetId, OriginMeta};

use crate::frame::decode_frames;
use crate::{contiguous_runs, ChunkBatch, OriginClient, OriginError, Result};

#[derive(Deserialize)]
struct MtimeBody {
    mtime: DateTime<Utc>,
}

/// Publisher client over HTTP.
pub struct HttpOrigin {
    client: reqwest::Client,
    bases: HashMap<String, Url>,
}

impl HttpOrigin {
    /// Build a client for the configured origins with a per-request timeout.
    pub fn new(origins: &[OriginConfig], timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OriginError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        Self::with_client(client, origins)
    }

    pub fn with_client(client: reqwest::Client, origins: &[OriginConfig]) -> Result<Self> {
        let mut bases = HashMap::new();
        for origin in origins {
            let url = Url::parse(&origin.url).map_err(|e| {
                OriginError::Protocol(format!("bad origin URL for {}: {}", origin.name, e))
            })?;
            if url.cannot_be_a_base() {
                return Err(OriginError::Protocol(format!(
                    "origin URL for {} cannot be a base: {}",
                    origin.name, origin.url
                )));
            }
            bases.insert(origin.name.clone(), url);
        }
        Ok(Self { client, bases })
    }

    fn endpoint(&self, root: &str, action: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .bases
            .get(root)
            .cloned()
            .ok_or_else(|| OriginError::NotFound(format!("no origin configured for root {}", root)))?;
        url.path_segments_mut()
            .map_err(|_| OriginError::Protocol(format!("bad base URL for {}", root)))?
            .pop_if_empty()
            .extend(["roots", root, action]);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>> {
        log_origin_debug!("GET", url = url.as_str());
        let response = self.client.get(url.clone()).send().await.map_err(map_reqwest)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(OriginError::NotFound(url.path().to_string()));
        }
        if status.is_server_error() {
            return Err(OriginError::Unreachable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(OriginError::Protocol(format!("{} returned {}", url, status)));
        }

        let body = response.bytes().await.map_err(map_reqwest)?;
        Ok(body.to_vec())
    }

    async fn get_json<T>(&self, url: Url) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let body = self.get_bytes(url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| OriginError::Protocol(format!("invalid JSON from origin: {}", e)))
    }

    async fn get_run(&self, id: &DatasetId, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let start_s = start.to_string();
        let end_s = end.to_string();
        let url = self.endpoint(
            &id.root,
            "chunks",
            &[("path", id.path.as_str()), ("start", start_s.as_str()), ("end", end_s.as_str())],
        )?;
        let body = self.get_bytes(url).await?;
        decode_frames(&body)
    }
}

fn map_reqwest(err: reqwest::Error) -> OriginError {
    if err.is_timeout() {
        OriginError::Timeout
    } else if err.is_connect() || err.is_request() {
        OriginError::Unreachable(err.to_string())
    } else {
        OriginError::Protocol(err.to_string())
    }
}

#[async_trait]
impl OriginClient for HttpOrigin {
    async fn list_datasets(&self, root: &str) -> Result<Vec<String>> {
        let url = self.endpoint(root, "datasets", &[])?;
        self.get_json(url).await
    }

    async fn get_meta(&self, id: &DatasetId) -> Result<OriginMeta> {
        let url = self.endpoint(&id.root, "meta", &[("path", id.path.as_str())])?;
        self.get_json(url).await
    }

    async fn get_mtime(&self, id: &DatasetId) -> Result<DateTime<Utc>> {
        let url = self.endpoint(&id.root, "mtime", &[("path", id.path.as_str())])?;
        let body: MtimeBody = self.get_json(url).await?;
        Ok(body.mtime)
    }

    async fn get_chunks(&self, id: &DatasetId, indices: &[u64]) -> Result<ChunkBatch> {
        if !self.bases.contains_key(&id.root) {
            return Err(OriginError::NotFound(format!(
                "no origin configured for root {}",
                id.root
            )));
        }

        let runs = contiguous_runs(indices);
        let results = join_all(runs.iter().map(|&(start, end)| self.get_run(id, start, end))).await;

        let mut batch = ChunkBatch::default();
        for (&(start, end), result) in runs.iter().zip(results) {
            match result {
                Ok(frames) => {
                    for (index, bytes) in frames {
                        if (start..end).contains(&index) {
                            batch.chunks.insert(index, bytes);
                        }
                    }
                }
                Err(e) => {
                    log_origin_warn!(
                        "Chunk range failed",
                        dataset = tracing::field::display(id),
                        start = start,
                        end = end,
                        error = tracing::field::display(&e),
                    );
                    for index in start..end {
                        batch.errors.insert(index, e.clone());
                    }
                }
            }
        }
        Ok(batch)
    }
}
