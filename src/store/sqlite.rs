//! [`SqliteBackend`] -- SQLite-backed ledger storage.
//!
//! List-valued columns (inputs, outputs, tags, provenance, formula ids) are
//! stored as JSON text. Tags are additionally indexed in `formula_tags` so
//! that tag queries do not scan the formulas table.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{BlockSealer, LedgerBackend, LedgerError, Result};
use crate::block::Block;
use crate::formula::{Formula, FormulaUpdate};
use crate::metrics::{MetricName, MetricsRecord, GLOBAL_METRICS_KEY};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS formulas (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        version     INTEGER NOT NULL DEFAULT 1,
        fitness     REAL,
        inputs      TEXT NOT NULL DEFAULT '[]',
        outputs     TEXT NOT NULL DEFAULT '[]',
        tags        TEXT NOT NULL DEFAULT '[]',
        timestamp   INTEGER NOT NULL,
        code        TEXT,
        cost        INTEGER NOT NULL DEFAULT 0,
        provenance  TEXT NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS formula_tags (
        formula_id  INTEGER NOT NULL REFERENCES formulas(id) ON DELETE CASCADE,
        tag         TEXT NOT NULL,
        PRIMARY KEY (formula_id, tag)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_formula_tags_tag ON formula_tags(tag)",
    r#"
    CREATE TABLE IF NOT EXISTS blocks (
        block_number INTEGER PRIMARY KEY,
        timestamp    INTEGER NOT NULL,
        formula_ids  TEXT NOT NULL DEFAULT '[]',
        data         TEXT NOT NULL DEFAULT 'null',
        merkle_root  TEXT NOT NULL,
        prev_hash    TEXT NOT NULL,
        hash         TEXT NOT NULL,
        author       TEXT,
        signature    TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        key              TEXT PRIMARY KEY,
        formula_count    INTEGER NOT NULL DEFAULT 0,
        execution_count  INTEGER NOT NULL DEFAULT 0,
        mutation_count   INTEGER NOT NULL DEFAULT 0,
        avg_fitness      REAL NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key    TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    )
    "#,
];

const FORMULA_COLUMNS: &str =
    "id, version, fitness, inputs, outputs, tags, timestamp, code, cost, provenance";
const BLOCK_COLUMNS: &str =
    "block_number, timestamp, formula_ids, data, merkle_root, prev_hash, hash, author, signature";
const METRICS_COLUMNS: &str =
    "key, formula_count, execution_count, mutation_count, avg_fitness";

/// Wraps a [`rusqlite::Connection`] in a `Mutex`; every call holds the lock
/// for its whole statement sequence.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (or creates) a database file and initialises the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(?path, "opening SQLite ledger");
        let conn = Connection::open(path).map_err(|e| {
            LedgerError::Storage(format!("failed to open {}: {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory SQLite ledger");
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| LedgerError::Storage(format!("failed to set pragmas: {e}")))?;
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)
                .map_err(|e| LedgerError::Storage(format!("schema init failed: {e}")))?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Storage(format!("mutex poisoned: {e}")))
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| LedgerError::Storage(e.to_string()))
}

fn formula_from_row(row: &Row<'_>) -> rusqlite::Result<Formula> {
    Ok(Formula {
        id: row.get::<_, i64>(0)? as u64,
        version: row.get(1)?,
        fitness: row.get(2)?,
        inputs: json_col(row, 3)?,
        outputs: json_col(row, 4)?,
        tags: json_col(row, 5)?,
        timestamp: row.get(6)?,
        code: row.get(7)?,
        cost: row.get(8)?,
        provenance: json_col(row, 9)?,
    })
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
    Ok(Block {
        block_number: row.get::<_, i64>(0)? as u64,
        timestamp: row.get(1)?,
        formula_ids: json_col(row, 2)?,
        data: json_col(row, 3)?,
        merkle_root: row.get(4)?,
        prev_hash: row.get(5)?,
        hash: row.get(6)?,
        author: row.get(7)?,
        signature: row.get(8)?,
    })
}

fn metrics_from_row(row: &Row<'_>) -> rusqlite::Result<MetricsRecord> {
    Ok(MetricsRecord {
        key: row.get(0)?,
        formula_count: row.get::<_, i64>(1)? as u64,
        execution_count: row.get::<_, i64>(2)? as u64,
        mutation_count: row.get::<_, i64>(3)? as u64,
        avg_fitness: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared by plain calls and transactions)
// ---------------------------------------------------------------------------

fn insert_formula_on(conn: &Connection, formula: &Formula) -> Result<u64> {
    conn.execute(
        "INSERT INTO formulas (version, fitness, inputs, outputs, tags, timestamp, code, cost, provenance)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            formula.version,
            formula.fitness,
            to_json(&formula.inputs)?,
            to_json(&formula.outputs)?,
            to_json(&formula.tags)?,
            formula.timestamp,
            formula.code,
            formula.cost,
            to_json(&formula.provenance)?,
        ],
    )?;
    let id = conn.last_insert_rowid();
    write_tags_on(conn, id, &formula.tags)?;
    Ok(id as u64)
}

fn write_tags_on(conn: &Connection, id: i64, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM formula_tags WHERE formula_id = ?1", params![id])?;
    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO formula_tags (formula_id, tag) VALUES (?1, ?2)")?;
    for tag in tags {
        stmt.execute(params![id, tag])?;
    }
    Ok(())
}

fn get_formula_on(conn: &Connection, id: u64) -> Result<Option<Formula>> {
    Ok(conn
        .query_row(
            &format!("SELECT {FORMULA_COLUMNS} FROM formulas WHERE id = ?1"),
            params![id as i64],
            formula_from_row,
        )
        .optional()?)
}

fn get_metrics_on(conn: &Connection, key: &str) -> Result<Option<MetricsRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {METRICS_COLUMNS} FROM metrics WHERE key = ?1"),
            params![key],
            metrics_from_row,
        )
        .optional()?)
}

fn put_metrics_on(conn: &Connection, record: &MetricsRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metrics (key, formula_count, execution_count, mutation_count, avg_fitness)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.key,
            record.formula_count as i64,
            record.execution_count as i64,
            record.mutation_count as i64,
            record.avg_fitness,
        ],
    )?;
    Ok(())
}

fn modify_metrics_on(
    conn: &Connection,
    key: &str,
    f: impl FnOnce(&mut MetricsRecord),
) -> Result<()> {
    if let Some(mut record) = get_metrics_on(conn, key)? {
        f(&mut record);
        put_metrics_on(conn, &record)?;
    }
    Ok(())
}

fn latest_block_on(conn: &Connection) -> Result<Option<Block>> {
    Ok(conn
        .query_row(
            &format!("SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY block_number DESC LIMIT 1"),
            [],
            block_from_row,
        )
        .optional()?)
}

fn query_formulas(conn: &Connection, sql: &str, args: &[String]) -> Result<Vec<Formula>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), formula_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// LedgerBackend
// ---------------------------------------------------------------------------

impl LedgerBackend for SqliteBackend {
    fn insert_formula(&self, formula: &Formula, bumps: &[MetricName]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = insert_formula_on(&tx, formula)?;
        modify_metrics_on(&tx, GLOBAL_METRICS_KEY, |m| {
            for name in bumps {
                m.adjust(*name, 1);
            }
        })?;
        tx.commit()?;
        Ok(id)
    }

    fn bulk_insert_formulas(&self, formulas: &[Formula]) -> Result<Vec<u64>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let ids = formulas
            .iter()
            .map(|f| insert_formula_on(&tx, f))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }

    fn get_formula(&self, id: u64) -> Result<Option<Formula>> {
        let conn = self.lock_conn()?;
        get_formula_on(&conn, id)
    }

    fn update_formula(&self, id: u64, update: &FormulaUpdate) -> Result<Option<Formula>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let Some(mut formula) = get_formula_on(&tx, id)? else {
            return Ok(None);
        };
        update.apply(&mut formula);
        tx.execute(
            "UPDATE formulas SET version = ?2, fitness = ?3, inputs = ?4, outputs = ?5,
                 tags = ?6, code = ?7, cost = ?8
             WHERE id = ?1",
            params![
                id as i64,
                formula.version,
                formula.fitness,
                to_json(&formula.inputs)?,
                to_json(&formula.outputs)?,
                to_json(&formula.tags)?,
                formula.code,
                formula.cost,
            ],
        )?;
        if update.tags.is_some() {
            write_tags_on(&tx, id as i64, &formula.tags)?;
        }
        tx.commit()?;
        Ok(Some(formula))
    }

    fn delete_formula(&self, id: u64, decrement: Option<MetricName>) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM formula_tags WHERE formula_id = ?1",
            params![id as i64],
        )?;
        let removed = tx.execute("DELETE FROM formulas WHERE id = ?1", params![id as i64])? > 0;
        if removed {
            if let Some(name) = decrement {
                modify_metrics_on(&tx, GLOBAL_METRICS_KEY, |m| m.adjust(name, -1))?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn scan_formulas(&self) -> Result<Vec<Formula>> {
        let conn = self.lock_conn()?;
        query_formulas(
            &conn,
            &format!("SELECT {FORMULA_COLUMNS} FROM formulas ORDER BY id"),
            &[],
        )
    }

    fn formulas_with_any_tag(&self, tags: &[String]) -> Result<Vec<Formula>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; tags.len()].join(", ");
        let conn = self.lock_conn()?;
        query_formulas(
            &conn,
            &format!(
                "SELECT {FORMULA_COLUMNS} FROM formulas WHERE id IN
                     (SELECT formula_id FROM formula_tags WHERE tag IN ({placeholders}))
                 ORDER BY id"
            ),
            tags,
        )
    }

    fn append_block(&self, seal: BlockSealer<'_>) -> Result<Block> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let head = latest_block_on(&tx)?;
        let block = seal(head.as_ref());
        tx.execute(
            &format!("INSERT INTO blocks ({BLOCK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                block.block_number as i64,
                block.timestamp,
                to_json(&block.formula_ids)?,
                to_json(&block.data)?,
                block.merkle_root,
                block.prev_hash,
                block.hash,
                block.author,
                block.signature,
            ],
        )?;
        tx.commit()?;
        Ok(block)
    }

    fn get_block(&self, block_number: u64) -> Result<Option<Block>> {
        let conn = self.lock_conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_number = ?1"),
                params![block_number as i64],
                block_from_row,
            )
            .optional()?)
    }

    fn latest_block(&self) -> Result<Option<Block>> {
        let conn = self.lock_conn()?;
        latest_block_on(&conn)
    }

    fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY block_number DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn scan_blocks(&self) -> Result<Vec<Block>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY block_number"
        ))?;
        let rows = stmt.query_map([], block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_metrics_record(&self, key: &str) -> Result<Option<MetricsRecord>> {
        let conn = self.lock_conn()?;
        get_metrics_on(&conn, key)
    }

    fn put_metrics_record(&self, record: &MetricsRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        put_metrics_on(&conn, record)
    }

    fn adjust_metric(&self, key: &str, name: MetricName, delta: i64) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        modify_metrics_on(&tx, key, |m| m.adjust(name, delta))?;
        tx.commit()?;
        Ok(())
    }

    fn set_metric(&self, key: &str, name: MetricName, value: f64) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        modify_metrics_on(&tx, key, |m| m.set(name, value))?;
        tx.commit()?;
        Ok(())
    }

    fn scan_metrics(&self) -> Result<Vec<MetricsRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {METRICS_COLUMNS} FROM metrics ORDER BY key"))?;
        let rows = stmt.query_map([], metrics_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn insert_setting_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(inserted > 0)
    }

    fn insert_metrics_if_absent(&self, record: &MetricsRecord) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let absent = get_metrics_on(&tx, &record.key)?.is_none();
        if absent {
            put_metrics_on(&tx, record)?;
        }
        tx.commit()?;
        Ok(absent)
    }

    fn clear_ledger(&self) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM formula_tags;
             DELETE FROM formulas;
             DELETE FROM blocks;
             DELETE FROM metrics;",
        )?;
        tx.commit()?;
        Ok(())
    }
}
