// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed session handles : [`ReadSession`] for lookups/enumeration,
//! and [`UpdateSession`], which adds inserts, removals, `flush`, and
//! `finish`.
//!
//! Both hold their backend session behind an `Option` rather than
//! consuming `self` by value in `finish`/`dispose`: this is what lets a
//! second call to either, or any other operation afterward, surface as a
//! runtime [`TreeError::SessionClosed`] the way a scoped resource's
//! contract requires, rather than becoming a compile-time "use of moved
//! value" error that would make that error variant unreachable. Scope-exit
//! rollback without an explicit `finish` is handled one layer down, by
//! each backend session's own `Drop` impl (see
//! `backend::memory::MemorySession`) — the façade just needs to let its
//! `Option<S>` drop normally.

use std::marker::PhantomData;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendSession, PointItem};
use crate::error::{Result, TreeError};
use crate::geometry::{Bound, Point};
use crate::tree;

const DEFAULT_BULK_BLOCK_SIZE: usize = 100_000;

/// Read-only session handle : lookups and range enumeration
/// only. Acquires the backend's shared read primitive for its lifetime.
#[derive(Debug)]
pub struct ReadSession<V, S> {
    inner: Option<S>,
    cancel: CancellationToken,
    _value: PhantomData<fn() -> V>,
}

impl<V, S> ReadSession<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    pub(crate) fn new(session: S, cancel: CancellationToken) -> Self {
        Self {
            inner: Some(session),
            cancel,
            _value: PhantomData,
        }
    }

    fn session(&self) -> Result<&S> {
        self.inner.as_ref().ok_or(TreeError::SessionClosed)
    }

    fn session_mut(&mut self) -> Result<&mut S> {
        self.inner.as_mut().ok_or(TreeError::SessionClosed)
    }

    /// The tree's overall bound, fixed for the tree's lifetime.
    pub fn entire(&self) -> Result<&Bound> {
        Ok(self.session()?.entire())
    }

    /// exact point lookup.
    pub async fn lookup_point(&mut self, p: &[f64]) -> Result<Vec<PointItem<V>>> {
        let cancel = self.cancel.clone();
        tree::lookup_point(self.session_mut()?, p, &cancel).await
    }

    /// range lookup, materialized into a `Vec`. Unordered.
    pub async fn lookup_bound(&mut self, b: &Bound, right_closed: bool) -> Result<Vec<PointItem<V>>> {
        let cancel = self.cancel.clone();
        tree::lookup_bound(self.session_mut()?, b, right_closed, &cancel).await
    }

    /// streaming range enumeration: a lazy, single-pass,
    /// cancellable sequence, concatenated across leaves in deterministic
    /// child order.
    pub fn enumerate_bound<'s>(
        &'s mut self,
        b: &'s Bound,
        right_closed: bool,
    ) -> Result<impl Stream<Item = Result<PointItem<V>>> + 's> {
        let cancel = self.cancel.clone();
        let session = self.inner.as_mut().ok_or(TreeError::SessionClosed)?;
        Ok(tree::enumerate_bound(session, b, right_closed, cancel))
    }

    /// Aborts the session, rolling back any backend-side read resources
    /// (a no-op for the in-memory backend; a `ROLLBACK` of the
    /// read-committed transaction for the SQL backend). Scope exit
    /// without calling this has the same effect.
    pub async fn dispose(&mut self) -> Result<()> {
        let session = self.inner.take().ok_or(TreeError::SessionClosed)?;
        session.dispose().await
    }
}

/// Read-write session handle : every [`ReadSession`] operation
/// plus point/bulk insert, point/range removal, `flush`, and `finish`.
/// Acquires the backend's exclusive write primitive for its lifetime; on
/// scope exit without `finish`, the backend rolls back every mutation
/// made through this handle.
#[derive(Debug)]
pub struct UpdateSession<V, S> {
    inner: Option<S>,
    cancel: CancellationToken,
    _value: PhantomData<fn() -> V>,
}

impl<V, S> UpdateSession<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: BackendSession<V> + Send,
{
    pub(crate) fn new(session: S, cancel: CancellationToken) -> Self {
        Self {
            inner: Some(session),
            cancel,
            _value: PhantomData,
        }
    }

    fn session(&self) -> Result<&S> {
        self.inner.as_ref().ok_or(TreeError::SessionClosed)
    }

    fn session_mut(&mut self) -> Result<&mut S> {
        self.inner.as_mut().ok_or(TreeError::SessionClosed)
    }

    /// The tree's overall bound, fixed for the tree's lifetime.
    pub fn entire(&self) -> Result<&Bound> {
        Ok(self.session()?.entire())
    }

    /// exact point lookup.
    pub async fn lookup_point(&mut self, p: &[f64]) -> Result<Vec<PointItem<V>>> {
        let cancel = self.cancel.clone();
        tree::lookup_point(self.session_mut()?, p, &cancel).await
    }

    /// range lookup, materialized into a `Vec`. Unordered.
    pub async fn lookup_bound(&mut self, b: &Bound, right_closed: bool) -> Result<Vec<PointItem<V>>> {
        let cancel = self.cancel.clone();
        tree::lookup_bound(self.session_mut()?, b, right_closed, &cancel).await
    }

    /// streaming range enumeration.
    pub fn enumerate_bound<'s>(
        &'s mut self,
        b: &'s Bound,
        right_closed: bool,
    ) -> Result<impl Stream<Item = Result<PointItem<V>>> + 's> {
        let cancel = self.cancel.clone();
        let session = self.inner.as_mut().ok_or(TreeError::SessionClosed)?;
        Ok(tree::enumerate_bound(session, b, right_closed, cancel))
    }

    /// insert one point, returning the depth it landed at.
    pub async fn insert_point(&mut self, point: Point, value: V) -> Result<usize> {
        let cancel = self.cancel.clone();
        tree::insert_point(self.session_mut()?, point, value, &cancel).await
    }

    /// bulk insert, sliced into blocks of `block_size` (default
    /// 100 000 per spec) run to completion one at a time. Returns the
    /// maximum depth observed across the whole batch.
    pub async fn insert_points(
        &mut self,
        items: Vec<PointItem<V>>,
        block_size: Option<usize>,
    ) -> Result<usize> {
        let cancel = self.cancel.clone();
        let block_size = block_size.unwrap_or(DEFAULT_BULK_BLOCK_SIZE);
        tree::insert_points_bulk(self.session_mut()?, items, block_size, &cancel).await
    }

    /// remove by exact point match. `shrink` requests bottom-up
    /// coalescing of subtrees that now fit within `MaxNodePoints`.
    pub async fn remove_point(&mut self, p: &[f64], shrink: bool) -> Result<usize> {
        let cancel = self.cancel.clone();
        tree::remove_point(self.session_mut()?, p, shrink, &cancel).await
    }

    /// remove by range. Same `shrink` semantics as
    /// [`Self::remove_point`].
    pub async fn remove_bound(&mut self, b: &Bound, right_closed: bool, shrink: bool) -> Result<usize> {
        let cancel = self.cancel.clone();
        tree::remove_bound(self.session_mut()?, b, right_closed, shrink, &cancel).await
    }

    /// Commits a partial checkpoint and immediately reopens a new
    /// underlying transaction (SQL backend); a no-op on the in-memory
    /// backend.
    pub async fn flush(&mut self) -> Result<()> {
        self.session_mut()?.flush().await
    }

    /// Commits the session. Any later call on this handle returns
    /// [`TreeError::SessionClosed`].
    pub async fn finish(&mut self) -> Result<()> {
        let session = self.inner.take().ok_or(TreeError::SessionClosed)?;
        session.finish().await
    }

    /// Rolls back every mutation made through this handle. Scope exit
    /// without calling this (or [`Self::finish`]) has the same effect.
    pub async fn dispose(&mut self) -> Result<()> {
        let session = self.inner.take().ok_or(TreeError::SessionClosed)?;
        session.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{Backend, PointItem};
    use crate::geometry::Axis;

    fn square(lo: f64, hi: f64) -> Bound {
        Bound::new([Axis::new(lo, hi), Axis::new(lo, hi)])
    }

    async fn update_session(
        max_node_points: usize,
    ) -> UpdateSession<&'static str, <MemoryBackend<&'static str> as Backend<&'static str>>::Session> {
        let backend = MemoryBackend::<&'static str>::new(square(0.0, 100.0), max_node_points);
        let session = backend.begin_session(true).await.unwrap();
        UpdateSession::new(session, CancellationToken::new())
    }

    #[tokio::test]
    async fn insert_then_lookup_through_facade() {
        let mut session = update_session(4).await;
        let depth = session
            .insert_point(smallvec![10.0, 10.0], "A")
            .await
            .unwrap();
        assert_eq!(depth, 0);
        let found = session.lookup_point(&[10.0, 10.0]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "A");
    }

    #[tokio::test]
    async fn operations_after_finish_are_session_closed() {
        let mut session = update_session(4).await;
        session
            .insert_point(smallvec![10.0, 10.0], "A")
            .await
            .unwrap();
        session.finish().await.unwrap();

        let err = session.lookup_point(&[10.0, 10.0]).await.unwrap_err();
        assert!(matches!(err, TreeError::SessionClosed));
        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, TreeError::SessionClosed));
    }

    #[tokio::test]
    async fn dispose_rolls_back_and_closes() {
        let mut session = update_session(4).await;
        session
            .insert_point(smallvec![10.0, 10.0], "A")
            .await
            .unwrap();
        session.dispose().await.unwrap();
        let err = session.insert_point(smallvec![20.0, 20.0], "B").await.unwrap_err();
        assert!(matches!(err, TreeError::SessionClosed));
    }

    #[tokio::test]
    async fn bulk_insert_default_block_size_round_trips() {
        let items: Vec<PointItem<i32>> = (0..20)
            .map(|i| PointItem {
                point: smallvec![i as f64, i as f64],
                value: i,
            })
            .collect();
        let backend = MemoryBackend::<i32>::new(square(0.0, 100.0), 4);
        let raw = backend.begin_session(true).await.unwrap();
        let mut session = UpdateSession::new(raw, CancellationToken::new());
        let max_depth = session.insert_points(items, None).await.unwrap();
        assert!(max_depth > 0);
        let all = session.lookup_bound(&square(0.0, 100.0), false).await.unwrap();
        assert_eq!(all.len(), 20);
    }
}
