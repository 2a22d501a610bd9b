//! # strata-core
//!
//! The subscriber's on-demand partial-fetch cache.
//!
//! ## Request Flow
//!
//! ```text
//! request ─► RootTracker (subscribed?) ─► FreshnessResolver (metadata epoch)
//!         ─► planner (chunk indices, row-major) ─► FetchCoordinator
//!            ├─ ChunkStore hit for the epoch ─► Cached
//!            └─ miss ─► ticket (one per chunk) ─► OriginClient ─► ChunkStore
//! ```
//!
//! [`Subscriber`] ties the pieces together and is what the daemon serves.

pub mod codec;
pub mod error;
pub mod fetch;
pub mod freshness;
pub mod planner;
pub mod roots;
pub mod subscriber;

pub use codec::{ChunkCodec, PassthroughCodec};
pub use error::{ChunkError, CoreError, Result};
pub use fetch::{ChunkOutcome, ChunkStatus, FetchCoordinator};
pub use freshness::{Freshness, FreshnessResolver};
pub use planner::{DimSlice, SlicePlan, SliceSpec};
pub use roots::{RootSummary, RootTracker};
pub use subscriber::{
    CacheStatus, ChunkData, Representation, SliceData, SliceRegion, Subscriber,
};
