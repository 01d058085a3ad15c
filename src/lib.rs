// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

// After you edit the crate's doc comment, run this command, then check README.md for any missing links
// cargo rdme --workspace-project=hyperoctree --heading-base-level=0

//! Hyperoctree: a pluggable N-dimensional point index — a generalized
//! quadtree/octree/hyper-octree that holds very large numbers of points,
//! each carrying an application-defined payload, and answers point and
//! range queries over them.
//!
//! The recursive tree algorithm ([`tree`], not part of this crate's
//! public surface) is storage-agnostic: it runs unmodified over either a
//! volatile in-memory backend ([`backend::memory::MemoryBackend`]) or a
//! transactional SQLite backend ([`backend::sql::SqlBackend`]), so
//! identical split/coalesce/query semantics hold across both.
//!
//! ## What this crate is not
//!
//! No nearest-neighbor (k-NN) search, no geometric primitives beyond
//! axis-aligned points and boxes, no guaranteed rebalancing after
//! deletion unless explicitly requested via `shrink`, and no GIS
//! coordinate systems or projections — coordinates are raw `f64`s.
//!
//! ## API overview
//!
//! - [`Tree`]: the index itself, generic over a payload type `V` and a
//!   [`backend::Backend`] `B`.
//! - [`create_tree_in_memory`] / [`Tree::in_memory`]: build a tree over
//!   the volatile backend.
//! - [`create_tree_with_adapter`]: build a tree over any
//!   [`backend::Backend`] implementation, including
//!   [`Tree::with_sqlite`]'s [`backend::sql::SqlBackend`].
//! - [`Tree::begin_read_session`] → [`ReadSession`]: `lookup_point`,
//!   `lookup_bound`, `enumerate_bound`.
//! - [`Tree::begin_update_session`] → [`UpdateSession`]: every
//!   `ReadSession` operation plus `insert_point`, `insert_points`,
//!   `remove_point`, `remove_bound`, `flush`, `finish`.
//!
//! # Example
//!
//! ```rust
//! use hyperoctree::geometry::{Axis, Bound};
//! use hyperoctree::create_tree_in_memory;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let entire = Bound::new([Axis::new(0.0, 100.0), Axis::new(0.0, 100.0)]);
//! let tree = create_tree_in_memory::<&'static str>(entire, 64);
//!
//! let mut session = tree.begin_update_session(CancellationToken::new()).await?;
//! session.insert_point(smallvec::smallvec![10.0, 10.0], "alice").await?;
//! session.insert_point(smallvec::smallvec![90.0, 90.0], "bob").await?;
//! session.finish().await?;
//!
//! let mut reader = tree.begin_read_session(CancellationToken::new()).await?;
//! let hits = reader.lookup_point(&[10.0, 10.0]).await?;
//! assert_eq!(hits[0].value, "alice");
//!
//! let query = Bound::new([Axis::new(0.0, 50.0), Axis::new(0.0, 50.0)]);
//! let nearby = reader.lookup_bound(&query, false).await?;
//! assert_eq!(nearby.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! You can point the same tree semantics at SQLite instead:
//!
//! ```rust
//! use hyperoctree::geometry::{Axis, Bound};
//! use hyperoctree::Tree;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let entire = Bound::new([Axis::new(0.0, 100.0), Axis::new(0.0, 100.0)]);
//! let tree = Tree::<i64, _>::with_sqlite_in_memory(entire, 64, "points")?;
//!
//! let mut session = tree.begin_update_session(CancellationToken::new()).await?;
//! session.insert_point(smallvec::smallvec![5.0, 5.0], 42).await?;
//! session.finish().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod geometry;
mod session;
mod tree;

pub use error::{Result, TreeError};
pub use session::{ReadSession, UpdateSession};

use std::marker::PhantomData;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use backend::memory::MemoryBackend;
use backend::sql::SqlBackend;
use backend::Backend;
use geometry::Bound;

/// The index itself: a storage backend `B` plus the payload
/// type `V` it holds. Construct one with [`create_tree_in_memory`],
/// [`create_tree_with_adapter`], or the `Tree::in_memory` /
/// `Tree::with_sqlite` convenience constructors, then open sessions
/// against it with [`Tree::begin_read_session`] /
/// [`Tree::begin_update_session`].
#[derive(Debug)]
pub struct Tree<V, B> {
    backend: B,
    _value: PhantomData<fn() -> V>,
}

impl<V, B> Tree<V, B>
where
    V: Clone + Send + Sync + 'static,
    B: Backend<V>,
{
    /// Opens a read-only session: lookups and range
    /// enumeration only, running in parallel with other read sessions.
    pub async fn begin_read_session(&self, cancel: CancellationToken) -> Result<ReadSession<V, B::Session>> {
        let session = self.backend.begin_session(false).await?;
        Ok(ReadSession::new(session, cancel))
    }

    /// Opens a read-write session, acquiring the backend's
    /// exclusive write primitive for the session's lifetime.
    pub async fn begin_update_session(
        &self,
        cancel: CancellationToken,
    ) -> Result<UpdateSession<V, B::Session>> {
        let session = self.backend.begin_session(true).await?;
        Ok(UpdateSession::new(session, cancel))
    }
}

/// `create_tree_with_adapter<V>(adapter) → Tree<V>`: build a
/// tree over any [`Backend`] implementation.
pub fn create_tree_with_adapter<V, B: Backend<V>>(adapter: B) -> Tree<V, B> {
    Tree {
        backend: adapter,
        _value: PhantomData,
    }
}

/// `create_tree_in_memory<V>(bound, max_node_points) → Tree<V>`: build a
/// tree over the volatile, single-process backend.
pub fn create_tree_in_memory<V: Clone + Send + Sync + 'static>(
    bound: Bound,
    max_node_points: usize,
) -> Tree<V, MemoryBackend<V>> {
    create_tree_with_adapter(MemoryBackend::new(bound, max_node_points))
}

impl<V: Clone + Send + Sync + 'static> Tree<V, MemoryBackend<V>> {
    /// Convenience wrapper over [`create_tree_in_memory`].
    pub fn in_memory(bound: Bound, max_node_points: usize) -> Self {
        create_tree_in_memory(bound, max_node_points)
    }
}

impl<V: Clone + Send + Sync + 'static> Tree<V, SqlBackend<V>> {
    /// Opens (creating if absent) a SQLite-backed tree at `path`, using
    /// the default `bincode` codec for the payload type.
    pub fn with_sqlite(
        path: impl AsRef<Path>,
        bound: Bound,
        max_node_points: usize,
        prefix: impl Into<String>,
    ) -> Result<Self>
    where
        V: Serialize + DeserializeOwned,
    {
        Ok(create_tree_with_adapter(SqlBackend::open(
            path,
            bound,
            max_node_points,
            prefix,
        )?))
    }

    /// An in-memory SQLite tree, still routed through the transactional
    /// adapter — useful for tests exercising the SQL code paths without a
    /// file on disk.
    pub fn with_sqlite_in_memory(bound: Bound, max_node_points: usize, prefix: impl Into<String>) -> Result<Self>
    where
        V: Serialize + DeserializeOwned,
    {
        Ok(create_tree_with_adapter(SqlBackend::in_memory(
            bound,
            max_node_points,
            prefix,
        )?))
    }
}
