// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Volatile, single-process realization of the storage adapter.
//!
//! A single [`tokio::sync::RwLock`] guards the tree state at session
//! granularity: write sessions acquire the lock exclusively and may not
//! run concurrently with any other session; read sessions acquire it
//! shared and may run in parallel with each other.
//!
//! A write session takes a snapshot of the state when it begins and
//! mutates the locked data directly; on `dispose` (or on drop without
//! `finish`) the snapshot is written back, undoing every mutation made
//! during the session. This gives scope-exit rollback without a
//! write-ahead log, at the cost of an upfront clone of the tree's node
//! and bucket maps — acceptable for a volatile backend whose whole point
//! is holding everything resident anyway.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::backend::{Backend, BackendSession, Node, NodeId, PointItem};
use crate::error::{Result, TreeError};
use crate::geometry::Bound;

#[derive(Clone)]
struct TreeData<V> {
    /// Internal nodes, keyed by id. A node id absent here (but present as
    /// a key in `buckets`) is a leaf.
    nodes: HashMap<NodeId, Node>,
    /// Leaf point buckets, keyed by id.
    buckets: HashMap<NodeId, Vec<PointItem<V>>>,
    next_id: i64,
}

impl<V> TreeData<V> {
    fn new() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(NodeId::ROOT, Vec::new());
        Self {
            nodes: HashMap::new(),
            buckets,
            next_id: NodeId::ROOT.0 + 1,
        }
    }

    fn alloc_ids(&mut self, count: usize) -> Vec<NodeId> {
        let start = self.next_id;
        self.next_id += count as i64;
        (0..count).map(|i| NodeId(start + i as i64)).collect()
    }
}

impl<V: Clone> TreeData<V> {
    fn clone_snapshot(&self) -> Self {
        self.clone()
    }
}

/// Volatile in-memory realization of [`crate::backend::Backend`].
#[derive(Debug)]
pub struct MemoryBackend<V> {
    entire: Bound,
    max_node_points: usize,
    state: Arc<RwLock<TreeData<V>>>,
}

impl<V> std::fmt::Debug for TreeData<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeData")
            .field("internal_nodes", &self.nodes.len())
            .field("leaf_nodes", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> MemoryBackend<V> {
    /// Creates an empty in-memory tree over `entire`, with the given
    /// per-leaf capacity.
    pub fn new(entire: Bound, max_node_points: usize) -> Self {
        Self {
            entire,
            max_node_points,
            state: Arc::new(RwLock::new(TreeData::new())),
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Backend<V> for MemoryBackend<V> {
    type Session = MemorySession<V>;

    async fn begin_session(&self, will_update: bool) -> Result<Self::Session> {
        let inner = if will_update {
            let guard = Arc::clone(&self.state).write_owned().await;
            let snapshot = guard.clone_snapshot();
            SessionInner::Write { guard, snapshot }
        } else {
            SessionInner::Read(Arc::clone(&self.state).read_owned().await)
        };
        tracing::debug!(will_update, "memory session opened");
        Ok(MemorySession {
            entire: self.entire.clone(),
            max_node_points: self.max_node_points,
            inner: Some(inner),
        })
    }
}

enum SessionInner<V> {
    Read(OwnedRwLockReadGuard<TreeData<V>>),
    Write {
        guard: OwnedRwLockWriteGuard<TreeData<V>>,
        snapshot: TreeData<V>,
    },
}

/// The in-memory backend's session: either a shared read guard or an
/// exclusive write guard plus a pre-mutation snapshot for rollback.
///
/// `inner` is `None` only after [`BackendSession::finish`] or
/// [`BackendSession::dispose`] has consumed it; both take `self` by value,
/// so this only matters for the [`Drop`] impl below, which is what
/// actually gives scope-exit rollback: on scope exit without `finish`, the
/// backend rolls back writes.
pub struct MemorySession<V> {
    entire: Bound,
    max_node_points: usize,
    inner: Option<SessionInner<V>>,
}

impl<V> MemorySession<V> {
    fn data(&self) -> &TreeData<V> {
        match self.inner.as_ref().expect("session used after close") {
            SessionInner::Read(g) => g,
            SessionInner::Write { guard, .. } => guard,
        }
    }

    fn data_mut(&mut self) -> Result<&mut TreeData<V>> {
        match self.inner.as_mut().expect("session used after close") {
            SessionInner::Read(_) => Err(TreeError::InvariantViolation(
                "attempted to mutate a read-only session".into(),
            )),
            SessionInner::Write { guard, .. } => Ok(guard),
        }
    }
}

/// Restores the pre-mutation snapshot if the session is dropped without an
/// explicit `finish()` — e.g. a caller bails out with `?` before reaching
/// `finish()`. Already-finished or already-disposed sessions leave `inner`
/// as `None`, so this is a no-op for them.
impl<V> Drop for MemorySession<V> {
    fn drop(&mut self) {
        if let Some(SessionInner::Write { mut guard, snapshot }) = self.inner.take() {
            *guard = snapshot;
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> BackendSession<V> for MemorySession<V> {
    fn entire(&self) -> &Bound {
        &self.entire
    }

    fn max_node_points(&self) -> usize {
        self.max_node_points
    }

    fn root_id(&self) -> NodeId {
        NodeId::ROOT
    }

    async fn get_node(&mut self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.data().nodes.get(&id).cloned())
    }

    async fn get_point_count(&mut self, id: NodeId) -> Result<usize> {
        Ok(self
            .data()
            .buckets
            .get(&id)
            .map_or(0, std::vec::Vec::len))
    }

    async fn insert_points(
        &mut self,
        node: NodeId,
        batch: &[PointItem<V>],
        offset: usize,
        force_all: bool,
    ) -> Result<usize> {
        let max_node_points = self.max_node_points;
        let data = self.data_mut()?;
        let bucket = data.buckets.get_mut(&node).ok_or_else(|| {
            TreeError::InvariantViolation(format!("insert_points on non-leaf node {node:?}"))
        })?;
        let available = batch.len() - offset;
        let take = if force_all {
            available
        } else {
            available.min(max_node_points.saturating_sub(bucket.len()))
        };
        bucket.extend(batch[offset..offset + take].iter().cloned());
        Ok(take)
    }

    async fn distribute_points(&mut self, node: NodeId, child_bounds: &[Bound]) -> Result<Node> {
        let data = self.data_mut()?;
        let bucket = data.buckets.remove(&node).ok_or_else(|| {
            TreeError::InvariantViolation(format!("distribute_points on non-leaf node {node:?}"))
        })?;
        let child_ids = data.alloc_ids(child_bounds.len());
        let mut child_buckets: Vec<Vec<PointItem<V>>> =
            (0..child_bounds.len()).map(|_| Vec::new()).collect();
        for item in bucket {
            let k = child_bounds
                .iter()
                .position(|b| b.contains(&item.point, false))
                .ok_or_else(|| {
                    TreeError::InvariantViolation(
                        "a leaf held a point outside every child bound during split".into(),
                    )
                })?;
            child_buckets[k].push(item);
        }
        for (id, bucket) in child_ids.iter().zip(child_buckets) {
            data.buckets.insert(*id, bucket);
        }
        let node_entry = Node {
            children: child_ids.into(),
        };
        data.nodes.insert(node, node_entry.clone());
        Ok(node_entry)
    }

    async fn aggregate_points(
        &mut self,
        children: &Node,
        parent_bound: &Bound,
        parent: NodeId,
    ) -> Result<()> {
        let data = self.data_mut()?;
        let mut merged = Vec::new();
        for child in &children.children {
            let bucket = data.buckets.remove(child).ok_or_else(|| {
                TreeError::InvariantViolation(format!(
                    "aggregate_points expected leaf child {child:?}"
                ))
            })?;
            for item in bucket {
                debug_assert!(
                    parent_bound.contains(&item.point, false),
                    "aggregated point must lie within the parent's bound"
                );
                merged.push(item);
            }
        }
        data.nodes.remove(&parent);
        data.buckets.insert(parent, merged);
        Ok(())
    }

    async fn lookup_point(&mut self, node: NodeId, p: &[f64]) -> Result<Vec<PointItem<V>>> {
        let bucket = self.data().buckets.get(&node).ok_or_else(|| {
            TreeError::InvariantViolation(format!("lookup_point on non-leaf node {node:?}"))
        })?;
        Ok(bucket
            .iter()
            .filter(|item| item.point.as_slice() == p)
            .cloned()
            .collect())
    }

    async fn lookup_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
    ) -> Result<Vec<PointItem<V>>> {
        let bucket = self.data().buckets.get(&node).ok_or_else(|| {
            TreeError::InvariantViolation(format!("lookup_bound on non-leaf node {node:?}"))
        })?;
        Ok(bucket
            .iter()
            .filter(|item| b.contains(&item.point, right_closed))
            .cloned()
            .collect())
    }

    async fn enumerate_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
    ) -> Result<Vec<PointItem<V>>> {
        self.lookup_bound(node, b, right_closed).await
    }

    async fn remove_point(
        &mut self,
        node: NodeId,
        p: &[f64],
        want_remains_hint: bool,
    ) -> Result<(usize, i64)> {
        let data = self.data_mut()?;
        let bucket = data.buckets.get_mut(&node).ok_or_else(|| {
            TreeError::InvariantViolation(format!("remove_point on non-leaf node {node:?}"))
        })?;
        let before = bucket.len();
        bucket.retain(|item| item.point.as_slice() != p);
        let removed = before - bucket.len();
        let remains = if want_remains_hint {
            bucket.len() as i64
        } else {
            -1
        };
        Ok((removed, remains))
    }

    async fn remove_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
        want_remains_hint: bool,
    ) -> Result<(usize, i64)> {
        let data = self.data_mut()?;
        let bucket = data.buckets.get_mut(&node).ok_or_else(|| {
            TreeError::InvariantViolation(format!("remove_bound on non-leaf node {node:?}"))
        })?;
        let before = bucket.len();
        bucket.retain(|item| !b.contains(&item.point, right_closed));
        let removed = before - bucket.len();
        let remains = if want_remains_hint {
            bucket.len() as i64
        } else {
            -1
        };
        Ok((removed, remains))
    }

    async fn flush(&mut self) -> Result<()> {
        // No-op: mutations are already visible through the live write guard.
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        // Take `inner` so `Drop` sees `None` and leaves the guard's
        // mutations (the committed state) untouched.
        self.inner.take();
        tracing::debug!("memory session finished");
        Ok(())
    }

    async fn dispose(mut self) -> Result<()> {
        if let Some(SessionInner::Write { mut guard, snapshot }) = self.inner.take() {
            *guard = snapshot;
        }
        tracing::debug!("memory session disposed");
        Ok(())
    }
}
