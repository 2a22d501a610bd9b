//! Concurrency tests: fetch de-duplication and atomic chunk writes
//!
//! Uses the multi-threaded runtime so callers genuinely race.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strata_config::testing::TestEnvironment;
use strata_core::{ChunkData, ChunkStatus, DimSlice, FetchCoordinator, Representation, SliceSpec, Subscriber};
use strata_meta::{DType, DatasetId};
use strata_origin::mock::{array_meta, MockOrigin};
use strata_store::ChunkStore;

const CHUNKS: u64 = 16;

fn origin_with_line(latency: Duration) -> Arc<MockOrigin> {
    let origin = Arc::new(MockOrigin::new());
    origin.add_dataset(
        "public",
        "/line",
        array_meta(&[CHUNKS * 10], &[10], DType::U8),
        (0..CHUNKS).map(|i| (i, vec![i as u8; 10])),
    );
    origin.set_latency(latency);
    origin
}

/// K callers with overlapping chunk sets cause one origin fetch per chunk.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_overlapping_requests_fetch_each_chunk_once() {
    let env = TestEnvironment::new().unwrap();
    let origin = origin_with_line(Duration::from_millis(50));
    let store = ChunkStore::new(&env.cache_root).unwrap();
    let coordinator = FetchCoordinator::new(store, origin.clone(), env.config().fetch);
    let id = DatasetId::new("public", "/line");
    let epoch = Utc::now();

    let mut handles = Vec::new();
    for k in 0..12u64 {
        let coordinator = coordinator.clone();
        let id = id.clone();
        // Windows of 6 chunks sliding by 1
        let wanted: Vec<u64> = (k..k + 6).map(|i| i % CHUNKS).collect();
        handles.push(tokio::spawn(async move {
            coordinator.ensure(&id, epoch, &wanted).await.unwrap()
        }));
    }

    for handle in handles {
        let outcomes = handle.await.unwrap();
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.values().all(|o| o.is_ok()));
    }

    for i in 0..CHUNKS {
        assert_eq!(origin.fetch_count("public", "/line", i), 1, "chunk {}", i);
    }
    assert_eq!(coordinator.in_flight(), 0);
}

/// Two slices needing the same chunk during a slow fetch share one origin call.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_slices_share_slow_fetch() {
    let env = TestEnvironment::new().unwrap();
    let origin = origin_with_line(Duration::ZERO);
    let sub = Subscriber::open(&env.config_with_roots(&["public"]), origin.clone()).unwrap();
    sub.subscribe("public").await.unwrap();
    sub.get_info("public", "/line").await.unwrap();
    origin.set_latency(Duration::from_millis(200));

    let spec = SliceSpec::Dims(vec![DimSlice::new(70, 80)]);
    let (a, b) = tokio::join!(
        sub.get_slice("public", "/line", &spec, Representation::Raw),
        sub.get_slice("public", "/line", &spec, Representation::Raw),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.regions.len(), 1);
    assert_eq!(a.regions[0].index, 7);
    assert_eq!(a.regions[0].data, ChunkData::Raw(vec![7; 10]));
    assert_eq!(a.regions[0].data, b.regions[0].data);
    assert_eq!(origin.fetch_count("public", "/line", 7), 1);
    assert_eq!(origin.chunk_calls(), 1);
}

/// Re-requesting within an unchanged epoch is served from the store.
#[tokio::test]
async fn test_refetch_in_same_epoch_short_circuits() {
    let env = TestEnvironment::new().unwrap();
    let origin = origin_with_line(Duration::ZERO);
    let sub = Subscriber::open(&env.config_with_roots(&["public"]), origin.clone()).unwrap();
    sub.subscribe("public").await.unwrap();
    let spec = SliceSpec::Dims(vec![DimSlice::new(30, 40)]);

    let first = sub
        .get_slice("public", "/line", &spec, Representation::Raw)
        .await
        .unwrap();
    let second = sub
        .get_slice("public", "/line", &spec, Representation::Raw)
        .await
        .unwrap();

    assert_eq!(first.regions[0].data, second.regions[0].data);
    assert_eq!(first.regions[0].status, ChunkStatus::Fetched);
    assert_eq!(second.regions[0].status, ChunkStatus::Cached);
    assert_eq!(origin.fetch_count("public", "/line", 3), 1);
}

/// Readers racing a writer see the old blob or the new one, never a mix.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_never_observe_partial_writes() {
    let env = TestEnvironment::new().unwrap();
    let store = ChunkStore::new(&env.cache_root).unwrap();
    let key = DatasetId::new("public", "/big").storage_key();

    let old = vec![0xAAu8; 256 * 1024];
    let new = vec![0x55u8; 256 * 1024];
    store.write(&key, 0, &old, Utc::now()).unwrap();

    let writer = {
        let store = store.clone();
        let key = key.clone();
        let (old, new) = (old.clone(), new.clone());
        tokio::task::spawn_blocking(move || {
            for round in 0..50 {
                let bytes = if round % 2 == 0 { &new } else { &old };
                store.write(&key, 0, bytes, Utc::now()).unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let key = key.clone();
        let (old, new) = (old.clone(), new.clone());
        readers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..200 {
                let chunk = store.read(&key, 0).unwrap().expect("chunk present");
                assert!(chunk.bytes == old || chunk.bytes == new, "torn read");
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}
