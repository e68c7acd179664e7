// =============================================================================
// Position persistence — optional SQLite-backed reload across restarts
// =============================================================================
//
// Mirrors the teacher's synchronous-`rusqlite`-behind-a-mutex shape: one
// connection, guarded by `parking_lot::Mutex`, with blocking calls pushed
// onto `spawn_blocking` so the async cycle loop never stalls on disk I/O.
// Positions are stored as JSON so the schema doesn't need a migration every
// time `Position`'s field set changes.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::types::Position;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    state TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_positions_state ON positions(state);
";

/// Backed by a real file when `database_url` is configured, otherwise a
/// no-op store so the engine runs unpersisted without special-casing every
/// call site.
pub struct PositionStore {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl PositionStore {
    /// Opens (and creates, if missing) the SQLite file at `database_url`.
    /// `None` yields a store that silently drops every write.
    pub fn open(database_url: Option<&str>) -> Result<Self> {
        let Some(url) = database_url else {
            info!("no database_url configured, position persistence disabled");
            return Ok(Self { conn: None });
        };
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = Connection::open(path).with_context(|| format!("failed to open position store at {path}"))?;
        conn.execute_batch(SCHEMA).context("failed to apply position store schema")?;
        info!(path, "position store opened");
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// In-memory store for tests and for a startup that never configured a
    /// `database_url` but still wants a writable table to exercise.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory position store")?;
        conn.execute_batch(SCHEMA).context("failed to apply position store schema")?;
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Upserts one position's full state. Called after every state-changing
    /// instruction so a crash mid-cycle loses at most one tick of drift.
    pub async fn save_position(&self, position: Position) -> Result<()> {
        let Some(conn) = self.conn.clone() else { return Ok(()) };
        tokio::task::spawn_blocking(move || {
            let payload = serde_json::to_string(&position).context("failed to serialize position")?;
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO positions (id, symbol, state, payload, updated_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET symbol = ?2, state = ?3, payload = ?4, updated_ts = ?5",
                params![
                    position.id,
                    position.symbol,
                    format!("{:?}", position.state),
                    payload,
                    chrono::Utc::now().timestamp_millis(),
                ],
            )
            .context("failed to upsert position row")?;
            Ok(())
        })
        .await
        .context("position save task panicked")?
    }

    /// Removes a closed position's row. Closed positions still get a final
    /// `save_position` first so `closed_positions()` history survives a
    /// restart via the caller's own in-memory ring; the row here only needs
    /// to track what must be reloaded as open.
    pub async fn delete_position(&self, position_id: &str) -> Result<()> {
        let Some(conn) = self.conn.clone() else { return Ok(()) };
        let position_id = position_id.to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .execute("DELETE FROM positions WHERE id = ?1", params![position_id])
                .context("failed to delete position row")?;
            Ok(())
        })
        .await
        .context("position delete task panicked")?
    }

    /// Reloads every row tagged with an open `state` at startup. Rows whose
    /// JSON payload fails to deserialize (schema drift across versions) are
    /// skipped with a warning rather than aborting startup.
    pub async fn reload_open_positions(&self) -> Result<Vec<Position>> {
        let Some(conn) = self.conn.clone() else { return Ok(Vec::new()) };
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare("SELECT payload FROM positions WHERE state != 'Closed'")
                .context("failed to prepare reload query")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("failed to run reload query")?;

            let mut positions = Vec::new();
            for row in rows {
                let payload = row.context("failed to read position row")?;
                match serde_json::from_str::<Position>(&payload) {
                    Ok(position) => positions.push(position),
                    Err(e) => warn!(error = %e, "skipping unreadable position row on reload"),
                }
            }
            Ok(positions)
        })
        .await
        .context("position reload task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountMode, Position, PositionMeta, PositionState, Side, Strategy};

    fn position(id: &str, state: PositionState) -> Position {
        Position {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty_open: if state == PositionState::Closed { 0.0 } else { 1.0 },
            initial_qty: 1.0,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit_levels: vec![],
            realized_pnl_usd: 0.0,
            realized_pnl_r: 0.0,
            opened_ts: 0,
            mode: AccountMode::Paper,
            strategy: Strategy::Momentum,
            state,
            origin_signal_id: None,
            meta: PositionMeta::default(),
            initial_stop_distance: 2.0,
        }
    }

    #[tokio::test]
    async fn disabled_store_no_ops() {
        let store = PositionStore::open(None).unwrap();
        store.save_position(position("p1", PositionState::Open)).await.unwrap();
        assert!(store.reload_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_position_round_trips_across_reload() {
        let store = PositionStore::in_memory().unwrap();
        store.save_position(position("p1", PositionState::Open)).await.unwrap();
        store.save_position(position("p2", PositionState::Reducing)).await.unwrap();

        let reloaded = store.reload_open_positions().await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.iter().any(|p| p.id == "p1"));
    }

    #[tokio::test]
    async fn closed_position_excluded_from_reload() {
        let store = PositionStore::in_memory().unwrap();
        store.save_position(position("p1", PositionState::Closed)).await.unwrap();
        assert!(store.reload_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_row_entirely() {
        let store = PositionStore::in_memory().unwrap();
        store.save_position(position("p1", PositionState::Open)).await.unwrap();
        store.delete_position("p1").await.unwrap();
        assert!(store.reload_open_positions().await.unwrap().is_empty());

        let conn = store.conn.as_ref().unwrap().lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
