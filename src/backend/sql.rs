// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transactional realization of the storage adapter, over SQLite via
//! `rusqlite` and a pooled connection manager (`r2d2` +
//! `r2d2_sqlite`), mirroring the pooled-connection idiom used for
//! zVault's SQLite storage layer.
//!
//! The relational schema is two tables per tree, name-prefixed:
//! `<prefix>_nodes(id, child_id0..child_id{2^d-1})` and
//! `<prefix>_node_points(node_id, x, y, z, axis3.., value)`. Bootstrap
//! (`CREATE TABLE IF NOT EXISTS` plus the root row) runs once, at
//! backend construction, the same way zVault's
//! `SqliteDepositStore::run_migrations` does it in one `execute_batch`.
//!
//! Prepared statements are cached by SQL text via `rusqlite`'s own
//! built-in statement cache (`Connection::prepare_cached`) — handles keyed
//! by query text, released to a free list internally — so no hand-rolled
//! pool is needed on top of it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{Backend, BackendSession, BincodeCodec, Codec, Node, NodeId, PointItem};
use crate::error::{Result, TreeError};
use crate::geometry::{Bound, Point};

fn axis_column(i: usize) -> String {
    match i {
        0 => "x".to_string(),
        1 => "y".to_string(),
        2 => "z".to_string(),
        n => format!("axis{n}"),
    }
}

fn child_column(k: usize) -> String {
    format!("child_id{k}")
}

fn bootstrap(conn: &rusqlite::Connection, prefix: &str, dims: usize) -> rusqlite::Result<()> {
    let child_cols: Vec<String> = (0..(1usize << dims))
        .map(|k| format!("{} INTEGER", child_column(k)))
        .collect();
    let nodes_sql = format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_nodes (id INTEGER PRIMARY KEY, {cols});",
        cols = child_cols.join(", ")
    );
    let axis_cols: Vec<String> = (0..dims).map(|i| format!("{} REAL", axis_column(i))).collect();
    let points_sql = format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_node_points (node_id INTEGER, {axis_cols}, value BLOB); \
         CREATE INDEX IF NOT EXISTS idx_{prefix}_node_points_node_id ON {prefix}_node_points(node_id);",
        axis_cols = axis_cols.join(", ")
    );
    conn.execute_batch(&format!("{nodes_sql}\n{points_sql}"))?;

    let child_placeholders: Vec<&str> = child_cols.iter().map(|_| "NULL").collect();
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {prefix}_nodes (id, {cols}) VALUES (0, {vals})",
            cols = (0..(1usize << dims)).map(child_column).collect::<Vec<_>>().join(", "),
            vals = child_placeholders.join(", ")
        ),
        [],
    )?;
    Ok(())
}

/// Transactional SQLite realization of [`crate::backend::Backend`].
pub struct SqlBackend<V> {
    pool: Pool<SqliteConnectionManager>,
    entire: Bound,
    max_node_points: usize,
    prefix: String,
    dims: usize,
    codec: Arc<dyn Codec<V>>,
}

impl<V: Send + Sync + 'static> SqlBackend<V> {
    /// Opens (creating if absent) a SQLite-backed tree at `path`, using
    /// the default `bincode` codec for the payload type.
    pub fn open(
        path: impl AsRef<Path>,
        entire: Bound,
        max_node_points: usize,
        prefix: impl Into<String>,
    ) -> Result<Self>
    where
        V: Serialize + DeserializeOwned,
    {
        Self::with_codec(path, entire, max_node_points, prefix, Arc::new(BincodeCodec))
    }

    /// Opens a SQLite-backed tree at `path` with a caller-supplied
    /// payload codec.
    pub fn with_codec(
        path: impl AsRef<Path>,
        entire: Bound,
        max_node_points: usize,
        prefix: impl Into<String>,
        codec: Arc<dyn Codec<V>>,
    ) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let manager = SqliteConnectionManager::file(path.as_ref());
        Self::build(manager, entire, max_node_points, prefix, codec)
    }

    /// An in-memory SQLite tree (still routed through the transactional
    /// adapter — useful for tests that want the SQL code paths without a
    /// file on disk), mirroring `SqliteDepositStore::in_memory()`.
    pub fn in_memory(entire: Bound, max_node_points: usize, prefix: impl Into<String>) -> Result<Self>
    where
        V: Serialize + DeserializeOwned,
    {
        let manager = SqliteConnectionManager::memory();
        // A single connection: each `:memory:` connection is its own private
        // database, so a pool size above 1 here would let sessions silently
        // observe disjoint trees (mirrors `SqliteDepositStore::in_memory()`'s
        // `max_size(1)`, unlike the file-backed pool's size-10 default).
        Self::build_with_pool_size(manager, entire, max_node_points, prefix, Arc::new(BincodeCodec), 1)
    }

    fn build(
        manager: SqliteConnectionManager,
        entire: Bound,
        max_node_points: usize,
        prefix: impl Into<String>,
        codec: Arc<dyn Codec<V>>,
    ) -> Result<Self> {
        Self::build_with_pool_size(manager, entire, max_node_points, prefix, codec, 10)
    }

    fn build_with_pool_size(
        manager: SqliteConnectionManager,
        entire: Bound,
        max_node_points: usize,
        prefix: impl Into<String>,
        codec: Arc<dyn Codec<V>>,
        pool_size: u32,
    ) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| TreeError::BackendFailure(e.to_string()))?;
        let prefix = prefix.into();
        let dims = entire.dims();
        {
            let conn = pool.get()?;
            bootstrap(&conn, &prefix, dims)?;
        }
        Ok(Self {
            pool,
            entire,
            max_node_points,
            prefix,
            dims,
            codec,
        })
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> Backend<V> for SqlBackend<V> {
    type Session = SqlSession<V>;

    async fn begin_session(&self, will_update: bool) -> Result<Self::Session> {
        let conn = self.pool.get()?;
        let begin_sql = if will_update {
            "BEGIN IMMEDIATE"
        } else {
            "BEGIN DEFERRED"
        };
        conn.execute_batch(begin_sql)?;
        tracing::debug!(will_update, prefix = %self.prefix, "sql session opened");
        Ok(SqlSession {
            conn: Some(conn),
            entire: self.entire.clone(),
            max_node_points: self.max_node_points,
            prefix: self.prefix.clone(),
            dims: self.dims,
            codec: Arc::clone(&self.codec),
            finished: false,
        })
    }
}

/// The SQL backend's session: a pooled connection with an open
/// transaction, released (rolled back if not finished) on drop.
pub struct SqlSession<V> {
    conn: Option<PooledConnection<SqliteConnectionManager>>,
    entire: Bound,
    max_node_points: usize,
    prefix: String,
    dims: usize,
    codec: Arc<dyn Codec<V>>,
    finished: bool,
}

impl<V> SqlSession<V> {
    fn conn(&self) -> &rusqlite::Connection {
        self.conn.as_ref().expect("session connection invariant violated: used after close")
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> BackendSession<V> for SqlSession<V> {
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
        let cols: Vec<String> = (0..(1usize << self.dims)).map(child_column).collect();
        let sql = format!(
            "SELECT {} FROM {}_nodes WHERE id = ?1",
            cols.join(", "),
            self.prefix
        );
        let mut stmt = self.conn().prepare_cached(&sql)?;
        let children: Option<Vec<Option<i64>>> = stmt
            .query_row([id.0], |row| {
                (0..cols.len()).map(|i| row.get::<_, Option<i64>>(i)).collect()
            })
            .optional()?;
        let Some(children) = children else {
            return Err(TreeError::InvariantViolation(format!(
                "node {id:?} has no row in {}_nodes",
                self.prefix
            )));
        };
        if children.iter().all(Option::is_none) {
            Ok(None)
        } else if children.iter().all(Option::is_some) {
            Ok(Some(Node {
                children: children.into_iter().flatten().map(NodeId).collect(),
            }))
        } else {
            Err(TreeError::InvariantViolation(format!(
                "node {id:?} has a mix of NULL and non-NULL children"
            )))
        }
    }

    async fn get_point_count(&mut self, id: NodeId) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}_node_points WHERE node_id = ?1", self.prefix);
        let mut stmt = self.conn().prepare_cached(&sql)?;
        let count: i64 = stmt.query_row([id.0], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn insert_points(
        &mut self,
        node: NodeId,
        batch: &[PointItem<V>],
        offset: usize,
        force_all: bool,
    ) -> Result<usize> {
        let current = self.get_point_count(node).await?;
        let available = batch.len() - offset;
        let take = if force_all {
            available
        } else {
            available.min(self.max_node_points.saturating_sub(current))
        };
        let placeholders: Vec<String> = (1..=self.dims + 2).map(|i| format!("?{i}")).collect();
        let cols: Vec<String> = (0..self.dims).map(axis_column).collect();
        let sql = format!(
            "INSERT INTO {}_node_points (node_id, {}, value) VALUES ({})",
            self.prefix,
            cols.join(", "),
            placeholders.join(", ")
        );
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        for item in &batch[offset..offset + take] {
            let bytes = self.codec.encode(&item.value);
            let mut values: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Integer(node.0)];
            for &c in &item.point {
                values.push(rusqlite::types::Value::Real(c));
            }
            values.push(rusqlite::types::Value::Blob(bytes));
            stmt.execute(params_from_iter(values))?;
        }
        Ok(take)
    }

    async fn distribute_points(&mut self, node: NodeId, child_bounds: &[Bound]) -> Result<Node> {
        let max_id: Option<i64> = {
            let sql = format!("SELECT MAX(id) FROM {}_nodes", self.prefix);
            let mut stmt = self.conn().prepare_cached(&sql)?;
            stmt.query_row([], |row| row.get(0))?
        };
        let start = max_id.unwrap_or(0) + 1;
        let child_ids: Vec<NodeId> = (0..child_bounds.len())
            .map(|i| NodeId(start + i as i64))
            .collect();

        {
            let all_cols: Vec<String> = (0..(1usize << self.dims)).map(child_column).collect();
            let insert_sql = format!(
                "INSERT INTO {}_nodes (id, {}) VALUES (?1, {})",
                self.prefix,
                all_cols.join(", "),
                all_cols.iter().map(|_| "NULL").collect::<Vec<_>>().join(", ")
            );
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(&insert_sql)?;
            for id in &child_ids {
                stmt.execute([id.0])?;
            }
        }

        let original_count = self.get_point_count(node).await?;
        let mut migrated = 0usize;
        for (child_id, bound) in child_ids.iter().zip(child_bounds) {
            let mut clauses = Vec::new();
            // Anonymous `?` placeholders bind positionally, in the order
            // `args` is built: new id, old id, then one (origin, to) pair
            // per axis.
            let mut args: Vec<rusqlite::types::Value> = vec![
                rusqlite::types::Value::Integer(child_id.0),
                rusqlite::types::Value::Integer(node.0),
            ];
            for (i, axis) in bound.axes().iter().enumerate() {
                let col = axis_column(i);
                clauses.push(format!("{col} >= ? AND {col} < ?"));
                args.push(rusqlite::types::Value::Real(axis.origin));
                args.push(rusqlite::types::Value::Real(axis.to));
            }
            let sql = format!(
                "UPDATE {}_node_points SET node_id = ? WHERE node_id = ? AND {}",
                self.prefix,
                clauses.join(" AND ")
            );
            let conn = self.conn();
            let changed = conn.execute(&sql, params_from_iter(args))?;
            migrated += changed;
        }

        if migrated != original_count {
            return Err(TreeError::InvariantViolation(format!(
                "split migrated {migrated} of {original_count} points out of node {node:?}; \
                 some points were outside every child bound"
            )));
        }

        let all_cols: Vec<String> = (0..(1usize << self.dims)).map(child_column).collect();
        let set_clause: Vec<String> = all_cols
            .iter()
            .enumerate()
            .map(|(k, col)| format!("{col} = ?{}", k + 1))
            .collect();
        let update_sql = format!(
            "UPDATE {}_nodes SET {} WHERE id = ?{}",
            self.prefix,
            set_clause.join(", "),
            all_cols.len() + 1
        );
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&update_sql)?;
        let mut args: Vec<rusqlite::types::Value> =
            child_ids.iter().map(|id| rusqlite::types::Value::Integer(id.0)).collect();
        args.push(rusqlite::types::Value::Integer(node.0));
        stmt.execute(params_from_iter(args))?;

        Ok(Node {
            children: child_ids.into(),
        })
    }

    async fn aggregate_points(
        &mut self,
        children: &Node,
        parent_bound: &Bound,
        parent: NodeId,
    ) -> Result<()> {
        let _ = parent_bound;
        for child in &children.children {
            let sql = format!(
                "UPDATE {}_node_points SET node_id = ?1 WHERE node_id = ?2",
                self.prefix
            );
            self.conn().execute(&sql, [parent.0, child.0])?;
            let del = format!("DELETE FROM {}_nodes WHERE id = ?1", self.prefix);
            self.conn().execute(&del, [child.0])?;
        }
        let all_cols: Vec<String> = (0..(1usize << self.dims)).map(child_column).collect();
        let set_clause: Vec<String> = all_cols.iter().map(|c| format!("{c} = NULL")).collect();
        let update_sql = format!(
            "UPDATE {}_nodes SET {} WHERE id = ?1",
            self.prefix,
            set_clause.join(", ")
        );
        self.conn().execute(&update_sql, [parent.0])?;
        Ok(())
    }

    async fn lookup_point(&mut self, node: NodeId, p: &[f64]) -> Result<Vec<PointItem<V>>> {
        let cols: Vec<String> = (0..self.dims).map(axis_column).collect();
        let clauses: Vec<String> = cols.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 2)).collect();
        let sql = format!(
            "SELECT node_id, {}, value FROM {}_node_points WHERE node_id = ?1 AND {}",
            cols.join(", "),
            self.prefix,
            clauses.join(" AND ")
        );
        let mut args: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Integer(node.0)];
        args.extend(p.iter().map(|&c| rusqlite::types::Value::Real(c)));
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| Ok(row_values(row, self.dims)))?;
        let mut out = Vec::new();
        for row in rows {
            let (point, bytes) = row?;
            out.push(PointItem {
                point,
                value: self.codec.decode(&bytes)?,
            });
        }
        Ok(out)
    }

    async fn lookup_bound(
        &mut self,
        node: NodeId,
        b: &Bound,
        right_closed: bool,
    ) -> Result<Vec<PointItem<V>>> {
        range_query(self, node, b, right_closed).await
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
        let cols: Vec<String> = (0..self.dims).map(axis_column).collect();
        let clauses: Vec<String> = cols.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 2)).collect();
        let sql = format!(
            "DELETE FROM {}_node_points WHERE node_id = ?1 AND {}",
            self.prefix,
            clauses.join(" AND ")
        );
        let mut args: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Integer(node.0)];
        args.extend(p.iter().map(|&c| rusqlite::types::Value::Real(c)));
        let removed = self.conn().execute(&sql, params_from_iter(args))?;
        let remains = if want_remains_hint {
            self.get_point_count(node).await? as i64
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
        let (clauses, args) = range_predicate(self.dims, b, right_closed);
        let sql = format!(
            "DELETE FROM {}_node_points WHERE node_id = ?1 AND {}",
            self.prefix,
            clauses.join(" AND ")
        );
        let mut full_args: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Integer(node.0)];
        full_args.extend(args);
        let removed = self.conn().execute(&sql, params_from_iter(full_args))?;
        let remains = if want_remains_hint {
            self.get_point_count(node).await? as i64
        } else {
            -1
        };
        Ok((removed, remains))
    }

    async fn flush(&mut self) -> Result<()> {
        self.conn().execute_batch("COMMIT; BEGIN IMMEDIATE")?;
        tracing::trace!(prefix = %self.prefix, "sql session flushed");
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        self.conn().execute_batch("COMMIT")?;
        self.finished = true;
        tracing::debug!(prefix = %self.prefix, "sql session finished");
        Ok(())
    }

    async fn dispose(mut self) -> Result<()> {
        self.conn().execute_batch("ROLLBACK")?;
        self.finished = true;
        tracing::debug!(prefix = %self.prefix, "sql session disposed");
        Ok(())
    }
}

fn row_values(row: &rusqlite::Row<'_>, dims: usize) -> (Point, Vec<u8>) {
    let point: Point = (0..dims)
        .map(|i| row.get::<_, f64>(i + 1).unwrap_or(f64::NAN))
        .collect();
    let bytes: Vec<u8> = row.get(dims + 1).unwrap_or_default();
    (point, bytes)
}

fn range_predicate(dims: usize, b: &Bound, right_closed: bool) -> (Vec<String>, Vec<rusqlite::types::Value>) {
    let mut clauses = Vec::with_capacity(dims * 2);
    let mut args = Vec::with_capacity(dims * 2);
    for (i, axis) in b.axes().iter().enumerate() {
        let col = axis_column(i);
        let upper_op = if right_closed { "<=" } else { "<" };
        clauses.push(format!("{col} >= ? AND {col} {upper_op} ?"));
        args.push(rusqlite::types::Value::Real(axis.origin));
        args.push(rusqlite::types::Value::Real(axis.to));
    }
    (clauses, args)
}

async fn range_query<V: Send + Sync + 'static>(
    session: &mut SqlSession<V>,
    node: NodeId,
    b: &Bound,
    right_closed: bool,
) -> Result<Vec<PointItem<V>>> {
    let cols: Vec<String> = (0..session.dims).map(axis_column).collect();
    let (clauses, range_args) = range_predicate(session.dims, b, right_closed);
    let sql = format!(
        "SELECT node_id, {}, value FROM {}_node_points WHERE node_id = ?1 AND {}",
        cols.join(", "),
        session.prefix,
        clauses.join(" AND ")
    );
    let mut args: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Integer(node.0)];
    args.extend(range_args);
    let dims = session.dims;
    let conn = session.conn();
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), move |row| Ok(row_values(row, dims)))?;
    let mut out = Vec::new();
    for row in rows {
        let (point, bytes) = row?;
        out.push(PointItem {
            point,
            value: session.codec.decode(&bytes)?,
        });
    }
    Ok(out)
}

impl<V> Drop for SqlSession<V> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(conn) = &self.conn {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }
}
