// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The storage-agnostic recursive tree algorithm: insert, bulk insert,
//! point/range lookup, streaming range enumeration, and
//! remove-with-or-without-shrinking.
//!
//! Every operation here is generic over `S: BackendSession<V>` and drives
//! the session through the primitives in [`crate::backend`]; none of it
//! knows whether it is talking to the in-memory or the SQL adapter.
//!
//! Fan-out across children (bulk-insert partitioning, range-query
//! descent) is modeled as sequential iteration rather than true
//! concurrent tasks: a single `&mut S` session cannot be borrowed by two
//! recursions at once without interior mutability neither adapter
//! exposes; each child's partition is handed to the adapter sequentially
//! once built. Sequential traversal here produces identical results to a
//! concurrent one; see DESIGN.md.

use futures::future::{BoxFuture, FutureExt};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::{BackendSession, NodeId, PointItem};
use crate::error::{Result, TreeError};
use crate::geometry::{Bound, Point};

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(TreeError::Cancelled)
    } else {
        Ok(())
    }
}

fn check_dims(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(TreeError::DimensionMismatch { expected, actual })
    }
}

/// insert a single point, descending from the root. Fails with
/// [`TreeError::OutOfBounds`] if the root does not contain `point`.
pub async fn insert_point<V, S>(
    session: &mut S,
    point: Point,
    value: V,
    cancel: &CancellationToken,
) -> Result<usize>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    let entire = session.entire().clone();
    check_dims(entire.dims(), point.len())?;
    if !entire.contains(&point, false) {
        return Err(TreeError::OutOfBounds {
            point: point.to_vec(),
        });
    }
    insert_at(session, session.root_id(), entire, point, value, 0, cancel).await
}

fn insert_at<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    bound: Bound,
    point: Point,
    value: V,
    depth: usize,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<usize>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        match session.get_node(node).await? {
            None => {
                let batch = [PointItem {
                    point: point.clone(),
                    value: value.clone(),
                }];
                let force_all = bound.is_zero_measure();
                let taken = session.insert_points(node, &batch, 0, force_all).await?;
                if taken == 1 {
                    return Ok(depth);
                }
                // Leaf is full and splittable: distribute, then retry at
                // the now-internal node.
                trace!(node_id = node.0, depth, "splitting full leaf node");
                let child_bounds = bound.child_bounds();
                let child_bounds: Vec<Bound> = child_bounds.into_vec();
                let split = session.distribute_points(node, &child_bounds).await?;
                let k = bound.child_index_of(&point).ok_or_else(|| {
                    TreeError::InvariantViolation(
                        "point not contained by any child bound after split".into(),
                    )
                })?;
                insert_at(
                    session,
                    split.children[k],
                    child_bounds[k].clone(),
                    point,
                    value,
                    depth + 1,
                    cancel,
                )
                .await
            }
            Some(internal) => {
                let child_bounds = bound.child_bounds();
                let k = bound.child_index_of(&point).ok_or_else(|| {
                    TreeError::InvariantViolation(
                        "point not contained by any child of an internal node".into(),
                    )
                })?;
                insert_at(
                    session,
                    internal.children[k],
                    child_bounds[k].clone(),
                    point,
                    value,
                    depth + 1,
                    cancel,
                )
                .await
            }
        }
    }
    .boxed()
}

/// bulk insert. `block_size` defaults to 100 000 per spec; the
/// batch is sliced into blocks which are run to completion one at a
/// time, each starting a fresh descent from the root, so memory for a
/// block's partitions is released before the next block starts.
pub async fn insert_points_bulk<V, S>(
    session: &mut S,
    items: Vec<PointItem<V>>,
    block_size: usize,
    cancel: &CancellationToken,
) -> Result<usize>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    let entire = session.entire().clone();
    for item in &items {
        check_dims(entire.dims(), item.point.len())?;
        if !entire.contains(&item.point, false) {
            return Err(TreeError::OutOfBounds {
                point: item.point.to_vec(),
            });
        }
    }
    let mut max_depth = 0usize;
    let total_blocks = items.len().div_ceil(block_size.max(1));
    for (i, block) in items.chunks(block_size.max(1)).enumerate() {
        check_cancelled(cancel)?;
        debug!(block = i, of = total_blocks, points = block.len(), "bulk-insert block");
        let root = session.root_id();
        let depth = bulk_insert_at(session, root, entire.clone(), block.to_vec(), 0, cancel).await?;
        max_depth = max_depth.max(depth);
    }
    Ok(max_depth)
}

fn bulk_insert_at<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    bound: Bound,
    points: Vec<PointItem<V>>,
    depth: usize,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<usize>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        if points.is_empty() {
            return Ok(depth);
        }
        let existing = session.get_node(node).await?;
        let (children, remaining) = match existing {
            Some(internal) => (internal, points),
            None => {
                let force_all = bound.is_zero_measure();
                let taken = session.insert_points(node, &points, 0, force_all).await?;
                if taken >= points.len() {
                    return Ok(depth);
                }
                trace!(node_id = node.0, depth, "splitting full leaf node during bulk insert");
                let child_bounds = bound.child_bounds();
                let child_bounds: Vec<Bound> = child_bounds.into_vec();
                let split = session.distribute_points(node, &child_bounds).await?;
                (split, points[taken..].to_vec())
            }
        };

        let child_bounds = bound.child_bounds();
        let mut partitions: Vec<Vec<PointItem<V>>> =
            (0..child_bounds.len()).map(|_| Vec::new()).collect();
        for item in remaining {
            let k = bound.child_index_of(&item.point).ok_or_else(|| {
                TreeError::InvariantViolation(
                    "bulk-insert point not contained by any child bound".into(),
                )
            })?;
            partitions[k].push(item);
        }

        let mut max_depth = depth;
        for (k, partition) in partitions.into_iter().enumerate() {
            if partition.is_empty() {
                continue;
            }
            let d = bulk_insert_at(
                session,
                children.children[k],
                child_bounds[k].clone(),
                partition,
                depth + 1,
                cancel,
            )
            .await?;
            max_depth = max_depth.max(d);
        }
        Ok(max_depth)
    }
    .boxed()
}

/// point lookup.
pub async fn lookup_point<V, S>(
    session: &mut S,
    p: &[f64],
    cancel: &CancellationToken,
) -> Result<Vec<PointItem<V>>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    let entire = session.entire().clone();
    check_dims(entire.dims(), p.len())?;
    lookup_point_at(session, session.root_id(), entire, p, cancel).await
}

fn lookup_point_at<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    bound: Bound,
    p: &'a [f64],
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<Vec<PointItem<V>>>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        match session.get_node(node).await? {
            None => session.lookup_point(node, p).await,
            Some(internal) => match bound.child_index_of(p) {
                Some(k) => {
                    let child_bounds = bound.child_bounds();
                    lookup_point_at(session, internal.children[k], child_bounds[k].clone(), p, cancel)
                        .await
                }
                None => Ok(Vec::new()),
            },
        }
    }
    .boxed()
}

/// range lookup: descend into every child whose bound
/// intersects the query range, append each leaf's matches. Unordered.
pub async fn lookup_bound<V, S>(
    session: &mut S,
    b: &Bound,
    right_closed: bool,
    cancel: &CancellationToken,
) -> Result<Vec<PointItem<V>>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    let entire = session.entire().clone();
    check_dims(entire.dims(), b.dims())?;
    let root = session.root_id();
    range_at(session, root, entire, b, right_closed, cancel).await
}

fn range_at<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    bound: Bound,
    query: &'a Bound,
    right_closed: bool,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<Vec<PointItem<V>>>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        if query.is_zero_measure() {
            return Ok(Vec::new());
        }
        match session.get_node(node).await? {
            None => session.lookup_bound(node, query, right_closed).await,
            Some(internal) => {
                let child_bounds = bound.child_bounds();
                let mut out = Vec::new();
                for (k, child_bound) in child_bounds.iter().enumerate() {
                    if child_bound.intersects(query, right_closed) {
                        let mut found = range_at(
                            session,
                            internal.children[k],
                            child_bound.clone(),
                            query,
                            right_closed,
                            cancel,
                        )
                        .await?;
                        out.append(&mut found);
                    }
                }
                Ok(out)
            }
        }
    }
    .boxed()
}

/// streaming range enumeration: a single flat, lazy,
/// single-pass sequence that concatenates each intersecting leaf's
/// matches in deterministic (bit-indexed) child order, without
/// materializing an intermediate `Vec` of node visits. Explicit
/// `Err(Cancelled)` short-circuits the descent the next time the
/// generator resumes — a cancellation signal short-circuits at the next
/// suspension point rather than unwinding mid-adapter-call.
///
/// Dimension-mismatch is checked eagerly (before the first `yield`) so
/// callers see it even if they never poll past the first item.
pub fn enumerate_bound<'s, V, S>(
    session: &'s mut S,
    b: &'s Bound,
    right_closed: bool,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<PointItem<V>>> + 's
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async_stream::try_stream! {
        let entire = session.entire().clone();
        if entire.dims() != b.dims() {
            Err(TreeError::DimensionMismatch {
                expected: entire.dims(),
                actual: b.dims(),
            })?;
        }
        if b.is_zero_measure() {
            return;
        }
        let root = session.root_id();
        // Explicit stack rather than recursion: a generator body can't
        // hold a second `&mut S` borrow across a recursive call the way
        // `range_at` does. Children are pushed highest-index-first so
        // popping yields the deterministic bit-indexed order (lowest
        // child first).
        let mut stack = vec![(root, entire)];
        while let Some((node, bound)) = stack.pop() {
            if cancel.is_cancelled() {
                Err(TreeError::Cancelled)?;
            }
            match session.get_node(node).await? {
                None => {
                    let items = session.enumerate_bound(node, b, right_closed).await?;
                    for item in items {
                        yield item;
                    }
                }
                Some(internal) => {
                    let child_bounds = bound.child_bounds();
                    for (k, child_bound) in child_bounds.iter().enumerate().rev() {
                        if child_bound.intersects(b, right_closed) {
                            stack.push((internal.children[k], child_bound.clone()));
                        }
                    }
                }
            }
        }
    }
}

/// remove by exact point match. `shrink` selects whether
/// internal nodes along the path attempt to coalesce after the delete.
pub async fn remove_point<V, S>(
    session: &mut S,
    p: &[f64],
    shrink: bool,
    cancel: &CancellationToken,
) -> Result<usize>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    let entire = session.entire().clone();
    check_dims(entire.dims(), p.len())?;
    let max_node_points = session.max_node_points();
    let root = session.root_id();
    let (removed, _remains) =
        remove_point_at(session, root, entire, p, shrink, max_node_points, cancel).await?;
    Ok(removed)
}

/// Recursively sums a subtree's *entire* live point count, not just a
/// single leaf's direct bucket (`BackendSession::get_point_count` only
/// reports the latter, returning `0` for an internal node). Short-circuits
/// once the running total reaches `budget`, mirroring the remains-hint
/// optimization this feeds: past that point no further counting changes
/// the caller's `< max_node_points` coalesce decision.
fn subtree_point_count<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    budget: usize,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<usize>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        match session.get_node(node).await? {
            None => session.get_point_count(node).await,
            Some(internal) => {
                let mut total = 0usize;
                for child in internal.children {
                    if total >= budget {
                        break;
                    }
                    total += subtree_point_count(session, child, budget - total, cancel).await?;
                }
                Ok(total)
            }
        }
    }
    .boxed()
}

#[allow(clippy::too_many_arguments, reason = "mirrors the adapter's own remove contract")]
fn remove_point_at<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    bound: Bound,
    p: &'a [f64],
    shrink: bool,
    max_node_points: usize,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<(usize, i64)>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        match session.get_node(node).await? {
            None => session.remove_point(node, p, shrink).await,
            Some(internal) => {
                let child_bounds = bound.child_bounds();
                if !shrink {
                    return match bound.child_index_of(p) {
                        Some(k) => {
                            let (removed, _) = remove_point_at(
                                session,
                                internal.children[k],
                                child_bounds[k].clone(),
                                p,
                                shrink,
                                max_node_points,
                                cancel,
                            )
                            .await?;
                            Ok((removed, -1))
                        }
                        None => Ok((0, -1)),
                    };
                }

                let target_k = bound.child_index_of(p);
                let mut total_removed = 0usize;
                let mut remains_hint = 0i64;
                // Coalescing a node means handing its children's buckets
                // straight to the parent (`aggregate_points`); that is only
                // valid when every child is itself a leaf. A non-target
                // sibling that is internal is surveyed by recursively
                // summing its own subtree rather than its direct (empty)
                // bucket, but it also rules out coalescing at this level.
                let mut all_children_are_leaves = true;
                for (k, child_bound) in child_bounds.iter().enumerate() {
                    if Some(k) == target_k {
                        let (removed, remains) = remove_point_at(
                            session,
                            internal.children[k],
                            child_bound.clone(),
                            p,
                            true,
                            max_node_points,
                            cancel,
                        )
                        .await?;
                        total_removed += removed;
                        remains_hint += remains.max(0);
                        if session.get_node(internal.children[k]).await?.is_some() {
                            all_children_are_leaves = false;
                        }
                    } else {
                        match session.get_node(internal.children[k]).await? {
                            None => {
                                if (remains_hint as usize) < max_node_points {
                                    remains_hint +=
                                        session.get_point_count(internal.children[k]).await? as i64;
                                }
                            }
                            Some(_) => {
                                all_children_are_leaves = false;
                                if (remains_hint as usize) < max_node_points {
                                    let budget = max_node_points - remains_hint as usize;
                                    remains_hint += subtree_point_count(
                                        session,
                                        internal.children[k],
                                        budget,
                                        cancel,
                                    )
                                    .await? as i64;
                                }
                            }
                        }
                    }
                }
                if all_children_are_leaves && (remains_hint as usize) < max_node_points {
                    trace!(node_id = node.0, remains = remains_hint, "coalescing shrunk subtree");
                    session.aggregate_points(&internal, &bound, node).await?;
                }
                Ok((total_removed, remains_hint))
            }
        }
    }
    .boxed()
}

/// remove by range. Same shrink/no-shrink shape as
/// [`remove_point`].
pub async fn remove_bound<V, S>(
    session: &mut S,
    b: &Bound,
    right_closed: bool,
    shrink: bool,
    cancel: &CancellationToken,
) -> Result<usize>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    let entire = session.entire().clone();
    check_dims(entire.dims(), b.dims())?;
    let max_node_points = session.max_node_points();
    let root = session.root_id();
    let (removed, _remains) = remove_bound_at(
        session,
        root,
        entire,
        b,
        right_closed,
        shrink,
        max_node_points,
        cancel,
    )
    .await?;
    Ok(removed)
}

#[allow(clippy::too_many_arguments, reason = "mirrors the adapter's own remove contract")]
fn remove_bound_at<'a, V, S>(
    session: &'a mut S,
    node: NodeId,
    bound: Bound,
    b: &'a Bound,
    right_closed: bool,
    shrink: bool,
    max_node_points: usize,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<(usize, i64)>>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    async move {
        check_cancelled(cancel)?;
        if b.is_zero_measure() {
            return Ok((0, -1));
        }
        match session.get_node(node).await? {
            None => session.remove_bound(node, b, right_closed, shrink).await,
            Some(internal) => {
                let child_bounds = bound.child_bounds();
                if !shrink {
                    let mut total = 0usize;
                    for (k, child_bound) in child_bounds.iter().enumerate() {
                        if child_bound.intersects(b, right_closed) {
                            let (removed, _) = remove_bound_at(
                                session,
                                internal.children[k],
                                child_bound.clone(),
                                b,
                                right_closed,
                                shrink,
                                max_node_points,
                                cancel,
                            )
                            .await?;
                            total += removed;
                        }
                    }
                    return Ok((total, -1));
                }

                let mut total_removed = 0usize;
                let mut remains_hint = 0i64;
                // Same leaves-only precondition as `remove_point_at`: only
                // coalesce if every child is a leaf, and survey a
                // non-recursed internal sibling by its whole subtree, not
                // its (empty) direct bucket.
                let mut all_children_are_leaves = true;
                for (k, child_bound) in child_bounds.iter().enumerate() {
                    if child_bound.intersects(b, right_closed) {
                        let (removed, remains) = remove_bound_at(
                            session,
                            internal.children[k],
                            child_bound.clone(),
                            b,
                            right_closed,
                            true,
                            max_node_points,
                            cancel,
                        )
                        .await?;
                        total_removed += removed;
                        remains_hint += remains.max(0);
                        if session.get_node(internal.children[k]).await?.is_some() {
                            all_children_are_leaves = false;
                        }
                    } else {
                        match session.get_node(internal.children[k]).await? {
                            None => {
                                if (remains_hint as usize) < max_node_points {
                                    remains_hint +=
                                        session.get_point_count(internal.children[k]).await? as i64;
                                }
                            }
                            Some(_) => {
                                all_children_are_leaves = false;
                                if (remains_hint as usize) < max_node_points {
                                    let budget = max_node_points - remains_hint as usize;
                                    remains_hint += subtree_point_count(
                                        session,
                                        internal.children[k],
                                        budget,
                                        cancel,
                                    )
                                    .await? as i64;
                                }
                            }
                        }
                    }
                }
                if all_children_are_leaves && (remains_hint as usize) < max_node_points {
                    trace!(node_id = node.0, remains = remains_hint, "coalescing shrunk subtree");
                    session.aggregate_points(&internal, &bound, node).await?;
                }
                Ok((total_removed, remains_hint))
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use futures::{pin_mut, StreamExt};
    use smallvec::smallvec;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::Backend;
    use crate::geometry::Axis;

    fn square(lo: f64, hi: f64) -> Bound {
        Bound::new([Axis::new(lo, hi), Axis::new(lo, hi)])
    }

    async fn backend_2d(max_node_points: usize) -> MemoryBackend<&'static str> {
        MemoryBackend::new(square(0.0, 100.0), max_node_points)
    }

    /// Five inserts force a split; a range query then prunes to the two
    /// points actually inside the query box.
    #[tokio::test]
    async fn scenario_split_then_range_query() {
        let backend = backend_2d(4).await;
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();
        let points: [(f64, f64, &str); 5] = [
            (10.0, 10.0, "A"),
            (20.0, 20.0, "B"),
            (30.0, 30.0, "C"),
            (40.0, 40.0, "D"),
            (50.0, 50.0, "E"),
        ];
        for (x, y, v) in points {
            insert_point(&mut session, smallvec![x, y], v, &cancel)
                .await
                .unwrap();
        }
        // Root must have split: it is now reported as internal.
        assert!(session.get_node(session.root_id()).await.unwrap().is_some());

        let entire = square(0.0, 100.0);
        let all = lookup_bound(&mut session, &entire, false, &cancel)
            .await
            .unwrap();
        let mut values: Vec<&str> = all.iter().map(|i| i.value).collect();
        values.sort_unstable();
        assert_eq!(values, vec!["A", "B", "C", "D", "E"]);

        // E landed alone in the upper-right quadrant.
        let upper_right = Bound::new([Axis::new(50.0, 100.0), Axis::new(50.0, 100.0)]);
        let found = lookup_bound(&mut session, &upper_right, false, &cancel)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "E");

        let query = Bound::new([Axis::new(15.0, 35.0), Axis::new(15.0, 35.0)]);
        let mut hit = lookup_bound(&mut session, &query, false, &cancel)
            .await
            .unwrap();
        hit.sort_by(|a, b| a.value.cmp(b.value));
        let hit_values: Vec<&str> = hit.iter().map(|i| i.value).collect();
        assert_eq!(hit_values, vec!["B", "C"]);
    }

    /// Removing a range with and without shrinking returns identical
    /// counts, but only `shrink=true` coalesces the root back into a
    /// single leaf.
    #[tokio::test]
    async fn remove_bound_with_and_without_shrink() {
        let cancel = CancellationToken::new();
        async fn insert_all(mut session: crate::backend::memory::MemorySession<&'static str>) -> crate::backend::memory::MemorySession<&'static str> {
            for (x, y, v) in [
                (10.0, 10.0, "A"),
                (20.0, 20.0, "B"),
                (30.0, 30.0, "C"),
                (40.0, 40.0, "D"),
                (50.0, 50.0, "E"),
            ] {
                insert_point(&mut session, smallvec![x, y], v, &CancellationToken::new())
                    .await
                    .unwrap();
            }
            session
        }

        let target = Bound::new([Axis::new(0.0, 50.0), Axis::new(0.0, 50.0)]);

        let backend_no_shrink = backend_2d(4).await;
        let session = backend_no_shrink.begin_session(true).await.unwrap();
        let mut session = insert_all(session).await;
        let removed = remove_bound(&mut session, &target, false, false, &cancel)
            .await
            .unwrap();
        assert_eq!(removed, 4);
        let entire = square(0.0, 100.0);
        let remaining = lookup_bound(&mut session, &entire, false, &cancel)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, "E");
        // Root is still internal: shrink was not requested.
        assert!(session.get_node(session.root_id()).await.unwrap().is_some());

        let backend_shrink = backend_2d(4).await;
        let session = backend_shrink.begin_session(true).await.unwrap();
        let mut session = insert_all(session).await;
        let removed = remove_bound(&mut session, &target, false, true, &cancel)
            .await
            .unwrap();
        assert_eq!(removed, 4);
        let remaining = lookup_bound(&mut session, &entire, false, &cancel)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, "E");
        // Root coalesced back into a single leaf.
        assert!(session.get_node(session.root_id()).await.unwrap().is_none());
    }

    /// Regression test for the remains-count survey undercounting a
    /// non-recursed sibling that is itself an internal subtree (it was
    /// being treated as holding 0 points, since `get_point_count` only
    /// reports a leaf's direct bucket). Forcing the lower-left quadrant
    /// into a deep internal subtree, then removing an unrelated point in
    /// the upper-right quadrant with `shrink=true`, must not attempt to
    /// coalesce the root through a non-leaf child.
    #[tokio::test]
    async fn shrink_remove_does_not_coalesce_through_an_internal_sibling() {
        let backend = backend_2d(2).await;
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();

        // Three points packed into the lower-left quadrant with
        // max_node_points=2 forces it into a deep internal subtree.
        for (x, y, v) in [(10.0, 10.0, "A"), (10.0, 11.0, "B"), (10.0, 12.0, "C")] {
            insert_point(&mut session, smallvec![x, y], v, &cancel)
                .await
                .unwrap();
        }
        insert_point(&mut session, smallvec![60.0, 60.0], "Z", &cancel)
            .await
            .unwrap();

        // Sanity check on the setup: the root's lower-left child is
        // internal, not a leaf.
        let root_node = session.get_node(session.root_id()).await.unwrap().unwrap();
        let lower_left = root_node.children[0];
        assert!(session.get_node(lower_left).await.unwrap().is_some());

        let removed = remove_point(&mut session, &[60.0, 60.0], true, &cancel)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        // A, B, C are untouched: no corruption, no stranded points.
        let entire = square(0.0, 100.0);
        let mut remaining: Vec<&str> = lookup_bound(&mut session, &entire, false, &cancel)
            .await
            .unwrap()
            .iter()
            .map(|i| i.value)
            .collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec!["A", "B", "C"]);

        // The root did not wrongly coalesce: its lower-left child is still
        // the same internal subtree.
        assert!(session.get_node(session.root_id()).await.unwrap().is_some());
        assert!(session.get_node(lower_left).await.unwrap().is_some());
    }

    /// An octree over 3D coordinates splits into 8 children and prunes a
    /// disjoint query to empty.
    #[tokio::test]
    async fn octree_split_and_disjoint_range() {
        let entire = Bound::new([Axis::new(0.0, 10.0), Axis::new(0.0, 10.0), Axis::new(0.0, 10.0)]);
        let backend = MemoryBackend::<&'static str>::new(entire.clone(), 2);
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();
        for (x, y, z, v) in [(1.0, 1.0, 1.0, "a"), (2.0, 2.0, 2.0, "b"), (3.0, 3.0, 3.0, "c")] {
            insert_point(&mut session, smallvec![x, y, z], v, &cancel)
                .await
                .unwrap();
        }
        let root_node = session.get_node(session.root_id()).await.unwrap().unwrap();
        assert_eq!(root_node.children.len(), 8);

        let near = Bound::new([Axis::new(0.0, 5.0), Axis::new(0.0, 5.0), Axis::new(0.0, 5.0)]);
        let found = lookup_bound(&mut session, &near, false, &cancel).await.unwrap();
        assert_eq!(found.len(), 3);

        let far = Bound::new([Axis::new(5.0, 10.0), Axis::new(5.0, 10.0), Axis::new(5.0, 10.0)]);
        let found = lookup_bound(&mut session, &far, false, &cancel).await.unwrap();
        assert!(found.is_empty());
    }

    /// `lookup_bound` and a materialized `enumerate_bound` agree.
    #[tokio::test]
    async fn enumerate_bound_matches_lookup_bound() {
        let backend = backend_2d(2).await;
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();
        for (x, y, v) in [(5.0, 5.0, "A"), (6.0, 6.0, "B"), (90.0, 90.0, "C")] {
            insert_point(&mut session, smallvec![x, y], v, &cancel).await.unwrap();
        }
        let query = square(0.0, 100.0);
        let via_lookup = lookup_bound(&mut session, &query, false, &cancel).await.unwrap();

        let stream = enumerate_bound(&mut session, &query, false, cancel.clone());
        pin_mut!(stream);
        let mut via_enumerate = Vec::new();
        while let Some(item) = stream.next().await {
            via_enumerate.push(item.unwrap());
        }

        let mut lookup_values: Vec<&str> = via_lookup.iter().map(|i| i.value).collect();
        let mut enum_values: Vec<&str> = via_enumerate.iter().map(|i| i.value).collect();
        lookup_values.sort_unstable();
        enum_values.sort_unstable();
        assert_eq!(lookup_values, enum_values);
    }

    /// a pre-cancelled token short-circuits at the first suspension
    /// point instead of performing the operation.
    #[tokio::test]
    async fn cancelled_token_short_circuits_insert() {
        let backend = backend_2d(4).await;
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = insert_point(&mut session, smallvec![1.0, 1.0], "x", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Cancelled));

        // Nothing was inserted: the session observed no mutation.
        let all = lookup_bound(&mut session, &square(0.0, 100.0), false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    /// dimensionality mismatches are rejected before touching the
    /// backend at all.
    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let backend = backend_2d(4).await;
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();
        let err = insert_point(&mut session, smallvec![1.0, 2.0, 3.0], "x", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    /// inserting outside the root bound fails with `OutOfBounds`.
    #[tokio::test]
    async fn out_of_bounds_insert_fails() {
        let backend = backend_2d(4).await;
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();
        let err = insert_point(&mut session, smallvec![200.0, 200.0], "x", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::OutOfBounds { .. }));
    }

    /// A bound that is already zero-measure on one axis (a line, not a
    /// square) can never be split further: every insert into it must use
    /// the forced, uncapped path rather than looping forever trying to
    /// distribute into narrower children.
    #[tokio::test]
    async fn zero_measure_bound_overflows_capacity_via_forced_insert() {
        let degenerate = Bound::new([Axis::new(5.0, 5.0), Axis::new(0.0, 100.0)]);
        let backend = crate::backend::memory::MemoryBackend::<&'static str>::new(degenerate, 2);
        let mut session = backend.begin_session(true).await.unwrap();
        let cancel = CancellationToken::new();

        // More than max_node_points (2) points, all on the degenerate line.
        for (y, v) in [(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")] {
            insert_point(&mut session, smallvec![5.0, y], v, &cancel)
                .await
                .unwrap();
        }

        // Still a leaf: a zero-measure bound is never split.
        assert!(session.get_node(session.root_id()).await.unwrap().is_none());
        assert_eq!(session.get_point_count(session.root_id()).await.unwrap(), 4);

        // The degenerate bound itself is zero-measure, so a range query
        // *over that exact bound* legally returns empty (spec: a
        // zero-measure query bound matches nothing). Query a non-degenerate
        // box that still covers the line to confirm the points are there.
        let all = lookup_bound(
            &mut session,
            &Bound::new([Axis::new(4.0, 6.0), Axis::new(0.0, 100.0)]),
            false,
            &cancel,
        )
        .await
        .unwrap();
        let mut values: Vec<&str> = all.iter().map(|i| i.value).collect();
        values.sort_unstable();
        assert_eq!(values, vec!["a", "b", "c", "d"]);
    }
}
