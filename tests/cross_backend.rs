// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Integration tests run against both backends to confirm the recursive
//! tree algorithm (`src/tree.rs`) behaves identically regardless of which
//! [`hyperoctree::backend::Backend`] drives it: splitting, range queries,
//! shrinking removal, persistence, and bulk insertion, scaled down to keep
//! the suite fast.

use hyperoctree::geometry::{Axis, Bound};
use hyperoctree::{create_tree_in_memory, Tree};
use smallvec::smallvec;
use tokio_util::sync::CancellationToken;

fn square(lo: f64, hi: f64) -> Bound {
    Bound::new([Axis::new(lo, hi), Axis::new(lo, hi)])
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// A small stand-in for a million-point bulk insert: large enough to
/// force several split levels at `MaxNodePoints = 8`, small enough to run
/// in milliseconds.
async fn bulk_insert_and_lookup_every_point(tree: &Tree<i64, impl hyperoctree::backend::Backend<i64>>) {
    let side = 40usize;
    let items: Vec<_> = (0..side)
        .flat_map(|x| (0..side).map(move |y| (x, y)))
        .map(|(x, y)| hyperoctree::backend::PointItem {
            point: smallvec![x as f64 + 0.5, y as f64 + 0.5],
            value: (x * side + y) as i64,
        })
        .collect();
    let total = items.len();

    let mut writer = tree.begin_update_session(token()).await.unwrap();
    writer.insert_points(items, Some(256)).await.unwrap();
    writer.finish().await.unwrap();

    let mut reader = tree.begin_read_session(token()).await.unwrap();
    for x in 0..side {
        for y in 0..side {
            let hits = reader
                .lookup_point(&[x as f64 + 0.5, y as f64 + 0.5])
                .await
                .unwrap();
            assert_eq!(hits.len(), 1, "missing point ({x}, {y})");
            assert_eq!(hits[0].value, (x * side + y) as i64);
        }
    }

    let all = reader.lookup_bound(&square(0.0, side as f64), false).await.unwrap();
    assert_eq!(all.len(), total);
}

#[tokio::test]
async fn memory_backend_bulk_insert_round_trips() {
    let tree = create_tree_in_memory::<i64>(square(0.0, 40.0), 8);
    bulk_insert_and_lookup_every_point(&tree).await;
}

#[tokio::test]
async fn sqlite_backend_bulk_insert_round_trips() {
    let tree = Tree::<i64, _>::with_sqlite_in_memory(square(0.0, 40.0), 8, "cross_backend").unwrap();
    bulk_insert_and_lookup_every_point(&tree).await;
}

/// Split then range-query, run against both backends to confirm the
/// descent produces identical results regardless of storage.
async fn split_then_range_query(tree: &Tree<String, impl hyperoctree::backend::Backend<String>>) {
    let mut writer = tree.begin_update_session(token()).await.unwrap();
    for (point, label) in [
        (smallvec![10.0, 10.0], "A"),
        (smallvec![20.0, 20.0], "B"),
        (smallvec![30.0, 30.0], "C"),
        (smallvec![40.0, 40.0], "D"),
        (smallvec![60.0, 60.0], "E"),
    ] {
        writer.insert_point(point, label.to_string()).await.unwrap();
    }
    writer.finish().await.unwrap();

    let mut reader = tree.begin_read_session(token()).await.unwrap();
    let everything = reader.lookup_bound(&square(0.0, 100.0), false).await.unwrap();
    assert_eq!(everything.len(), 5);

    let upper_right = reader.lookup_bound(&square(50.0, 100.0), false).await.unwrap();
    assert_eq!(upper_right.len(), 1);
    assert_eq!(upper_right[0].value, "E");

    let mid_band = reader.lookup_bound(&square(15.0, 35.0), false).await.unwrap();
    let mut values: Vec<_> = mid_band.iter().map(|item| item.value.clone()).collect();
    values.sort_unstable();
    assert_eq!(values, vec!["B".to_string(), "C".to_string()]);
}

#[tokio::test]
async fn memory_backend_split_then_range_query() {
    let tree = create_tree_in_memory::<String>(square(0.0, 100.0), 2);
    split_then_range_query(&tree).await;
}

#[tokio::test]
async fn sqlite_backend_split_then_range_query() {
    let tree = Tree::<String, _>::with_sqlite_in_memory(square(0.0, 100.0), 2, "range").unwrap();
    split_then_range_query(&tree).await;
}

/// Remove-with-shrink: removing every point but one should coalesce the
/// tree back down to a single leaf.
async fn remove_with_shrink_coalesces(tree: &Tree<String, impl hyperoctree::backend::Backend<String>>) {
    let mut writer = tree.begin_update_session(token()).await.unwrap();
    for (point, label) in [
        (smallvec![10.0, 10.0], "A"),
        (smallvec![20.0, 20.0], "B"),
        (smallvec![30.0, 30.0], "C"),
        (smallvec![40.0, 40.0], "D"),
        (smallvec![60.0, 60.0], "E"),
    ] {
        writer.insert_point(point, label.to_string()).await.unwrap();
    }

    let removed = writer
        .remove_bound(&square(0.0, 50.0), false, true)
        .await
        .unwrap();
    assert_eq!(removed, 4);
    writer.finish().await.unwrap();

    let mut reader = tree.begin_read_session(token()).await.unwrap();
    let remaining = reader.lookup_bound(&square(0.0, 100.0), false).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].value, "E");
}

#[tokio::test]
async fn memory_backend_remove_with_shrink_coalesces() {
    let tree = create_tree_in_memory::<String>(square(0.0, 100.0), 2);
    remove_with_shrink_coalesces(&tree).await;
}

#[tokio::test]
async fn sqlite_backend_remove_with_shrink_coalesces() {
    let tree = Tree::<String, _>::with_sqlite_in_memory(square(0.0, 100.0), 2, "shrink").unwrap();
    remove_with_shrink_coalesces(&tree).await;
}

/// Regression coverage for a shrink-remove whose coalescing decision at an
/// internal node must survey a *non-recursed sibling that is itself an
/// internal subtree*. Packing three points into the lower-left quadrant
/// with `max_node_points = 2` forces it to stay a deep internal subtree;
/// removing an unrelated point elsewhere with `shrink = true` must leave
/// that subtree (and its points) intact on both backends rather than
/// attempting to coalesce through it.
async fn shrink_remove_does_not_coalesce_through_an_internal_sibling(
    tree: &Tree<String, impl hyperoctree::backend::Backend<String>>,
) {
    let mut writer = tree.begin_update_session(token()).await.unwrap();
    for (point, label) in [
        (smallvec![10.0, 10.0], "A"),
        (smallvec![10.0, 11.0], "B"),
        (smallvec![10.0, 12.0], "C"),
    ] {
        writer.insert_point(point, label.to_string()).await.unwrap();
    }
    writer.insert_point(smallvec![60.0, 60.0], "Z".to_string()).await.unwrap();

    let removed = writer.remove_point(&[60.0, 60.0], true).await.unwrap();
    assert_eq!(removed, 1);
    writer.finish().await.unwrap();

    let mut reader = tree.begin_read_session(token()).await.unwrap();
    let mut remaining: Vec<_> = reader
        .lookup_bound(&square(0.0, 100.0), false)
        .await
        .unwrap()
        .iter()
        .map(|item| item.value.clone())
        .collect();
    remaining.sort_unstable();
    assert_eq!(remaining, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

#[tokio::test]
async fn memory_backend_shrink_remove_does_not_coalesce_through_an_internal_sibling() {
    let tree = create_tree_in_memory::<String>(square(0.0, 100.0), 2);
    shrink_remove_does_not_coalesce_through_an_internal_sibling(&tree).await;
}

#[tokio::test]
async fn sqlite_backend_shrink_remove_does_not_coalesce_through_an_internal_sibling() {
    let tree =
        Tree::<String, _>::with_sqlite_in_memory(square(0.0, 100.0), 2, "shrink_internal_sibling").unwrap();
    shrink_remove_does_not_coalesce_through_an_internal_sibling(&tree).await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The SQL backend is transactional storage, not volatile memory: data
/// written and committed in one `Tree` handle must be readable by a fresh
/// handle reopened against the same file.
#[tokio::test]
async fn sqlite_backend_persists_to_a_file_across_reopens() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.db");

    {
        let tree = Tree::<String, _>::with_sqlite(&path, square(0.0, 100.0), 4, "pts").unwrap();
        let mut writer = tree.begin_update_session(token()).await.unwrap();
        writer
            .insert_point(smallvec![12.0, 34.0], "persisted".to_string())
            .await
            .unwrap();
        writer.finish().await.unwrap();
    }

    let reopened = Tree::<String, _>::with_sqlite(&path, square(0.0, 100.0), 4, "pts").unwrap();
    let mut reader = reopened.begin_read_session(token()).await.unwrap();
    let found = reader.lookup_point(&[12.0, 34.0]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, "persisted");
}

/// Bulk-insert a batch of points sampled uniformly at random over the
/// tree's bound, then confirm every one of them is reachable by exact
/// point lookup and carries its own value.
async fn bulk_insert_random_points_round_trip(tree: &Tree<i64, impl hyperoctree::backend::Backend<i64>>) {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let side = 1000.0;
    let count = 2_000usize;
    let items: Vec<_> = (0..count)
        .map(|i| hyperoctree::backend::PointItem {
            point: smallvec![rng.gen_range(0.0..side), rng.gen_range(0.0..side)],
            value: i as i64,
        })
        .collect();
    let points: Vec<_> = items.iter().map(|item| item.point.clone()).collect();

    let mut writer = tree.begin_update_session(token()).await.unwrap();
    writer.insert_points(items, Some(256)).await.unwrap();
    writer.finish().await.unwrap();

    let mut reader = tree.begin_read_session(token()).await.unwrap();
    for (i, point) in points.iter().enumerate() {
        let hits = reader.lookup_point(point).await.unwrap();
        assert!(!hits.is_empty(), "missing point {point:?} (index {i})");
        assert!(hits.iter().all(|h| h.point == *point));
    }
}

#[tokio::test]
async fn memory_backend_bulk_insert_random_points_round_trips() {
    init_tracing();
    let tree = create_tree_in_memory::<i64>(square(0.0, 1000.0), 64);
    bulk_insert_random_points_round_trip(&tree).await;
}

#[tokio::test]
async fn sqlite_backend_bulk_insert_random_points_round_trips() {
    let tree = Tree::<i64, _>::with_sqlite_in_memory(square(0.0, 1000.0), 64, "random").unwrap();
    bulk_insert_random_points_round_trip(&tree).await;
}
