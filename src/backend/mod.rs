// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The storage adapter contract : node lookup, split/coalesce
//! persistence, per-node point CRUD, and session/transaction lifecycle.
//!
//! Two realizations live alongside this module: [`memory`] (volatile,
//! single-process, reader-writer exclusion) and [`sql`] (SQLite via
//! `rusqlite`, transactional). Both implement the same [`Backend`] /
//! [`BackendSession`] contract so the tree algorithm in [`crate::tree`]
//! runs unmodified over either.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{Result, TreeError};
use crate::geometry::{Bound, Point};

/// Opaque, backend-chosen node identifier. Both shipped backends use a
/// single 64-bit signed counter, abstracted behind the adapter so either
/// backend can choose its own id scheme so long as it is equality-
/// comparable and persistable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub i64);

impl NodeId {
    /// The backend-defined fixed identifier of the root node.
    pub const ROOT: Self = Self(0);
}

/// An internal node's `2^d` child identifiers, bit-indexed in the same
/// order as [`crate::geometry::Bound::child_bounds`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Child ids, one per sub-cell.
    pub children: SmallVec<[NodeId; 16]>,
}

/// A `(point, value)` pair. `value` is opaque to the tree algorithm.
#[derive(Debug, Clone)]
pub struct PointItem<V> {
    /// The point's coordinates.
    pub point: Point,
    /// The caller's payload.
    pub value: V,
}

/// Serializes a payload `V` to and from bytes for the SQL backend. The
/// core treats `V` opaquely; the relational adapter needs *some* byte
/// representation to store in the `value` column, blob by default.
pub trait Codec<V>: Send + Sync {
    /// Serializes a value to its stored byte representation.
    fn encode(&self, value: &V) -> Vec<u8>;
    /// Deserializes a value from its stored byte representation.
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// The default codec: `bincode` over `serde::Serialize`/`DeserializeOwned`.
/// Matches zVault's `serde` + `bincode` ambient pairing for encoding
/// persisted records.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<V> Codec<V> for BincodeCodec
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &V) -> Vec<u8> {
        bincode::serialize(value).expect("payload type must be bincode-serializable")
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes)
            .map_err(|e| TreeError::BackendFailure(format!("payload decode failed: {e}")))
    }
}

/// A storage medium capable of opening sessions. Generic rather than
/// trait-object-based, so the hot path monomorphizes instead of paying for
/// dynamic dispatch on every adapter call.
#[async_trait]
pub trait Backend<V: Send + Sync + 'static>: Send + Sync {
    /// The session type this backend opens.
    type Session: BackendSession<V>;

    /// Opens a new session. `will_update` selects write (exclusive) vs.
    /// read (shared) intent.
    async fn begin_session(&self, will_update: bool) -> Result<Self::Session>;
}

/// The per-session contract. A session owns whatever lock guard,
/// connection, or prepared-statement cache the backend needs, and exposes
/// the session-local constants plus the primitive node/point CRUD
/// operations the tree algorithm composes.
#[async_trait]
pub trait BackendSession<V: Send + Sync + 'static>: Send {
    /// The tree's overall bound.
    fn entire(&self) -> &Bound;
    /// The tree's per-leaf capacity.
    fn max_node_points(&self) -> usize;
    /// The backend-defined root node id.
    fn root_id(&self) -> NodeId;

    /// Returns the node's child-id tuple if it is internal, `None` if it
    /// is a leaf.
    async fn get_node(&mut self, id: NodeId) -> Result<Option<Node>>;

    /// Bucket size of a leaf.
    async fn get_point_count(&mut self, id: NodeId) -> Result<usize>;

    /// Appends points into a leaf's bucket starting at `batch[offset]`.
    /// Caps at `max_node_points - current_count` unless `force_all` is
    /// set, in which case every remaining item in `batch` is inserted.
    /// Returns how many were taken.
    async fn insert_points(
        &mut self,
        node: NodeId,
        batch: &[PointItem<V>],
        offset: usize,
        force_all: bool,
    ) -> Result<usize>;

    /// Atomically converts a leaf to an internal node with `2^d` fresh
    /// children, redistributing the leaf's bucket among them by
    /// right-open containment against `child_bounds`. Returns the new
    /// [`Node`].
    async fn distribute_points(&mut self, node: NodeId, child_bounds: &[Bound]) -> Result<Node>;

    /// Inverse of [`Self::distribute_points`]: moves every point from the
    /// `2^d` leaf children into the parent's bucket, deletes the
    /// children, and turns the parent back into a leaf.
    async fn aggregate_points(
        &mut self,
        children: &Node,
        parent_bound: &Bound,
        parent: NodeId,
    ) -> Result<()>;

    /// All items in a leaf whose point is exactly `p`.
    async fn lookup_point(&mut self, node: NodeId, p: &[f64]) -> Result<Vec<PointItem<V>>>;

    /// All items in a leaf within `b`.
    async fn lookup_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
    ) -> Result<Vec<PointItem<V>>>;

    /// Single-pass enumeration over items in a leaf within `b`. Returned
    /// as a materialized `Vec` at the adapter boundary (a single leaf's
    /// bucket is bounded by `max_node_points`); the tree algorithm's
    /// [`crate::tree::enumerate_bound`] is what composes these lazily
    /// across leaves.
    async fn enumerate_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
    ) -> Result<Vec<PointItem<V>>>;

    /// Deletes points matching `p` exactly from a leaf. Returns
    /// `(removed_count, remains_hint)`; `remains_hint` is `-1` if
    /// `want_remains_hint` was `false`.
    async fn remove_point(
        &mut self,
        node: NodeId,
        p: &[f64],
        want_remains_hint: bool,
    ) -> Result<(usize, i64)>;

    /// Deletes points within `b` from a leaf. Same return convention as
    /// [`Self::remove_point`].
    async fn remove_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
        want_remains_hint: bool,
    ) -> Result<(usize, i64)>;

    /// Commits a partial checkpoint and reopens a new underlying
    /// transaction. A no-op on the in-memory backend.
    async fn flush(&mut self) -> Result<()>;

    /// Commits the session.
    async fn finish(self) -> Result<()>;

    /// Rolls back the session.
    async fn dispose(self) -> Result<()>;
}
