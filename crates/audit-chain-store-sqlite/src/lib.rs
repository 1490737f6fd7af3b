#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use audit_chain_domain::{
    format_rfc3339, now_utc, ChainLink, DecisionProof, Handshake, RunId, StageName, StoredLink,
};
use audit_chain_store::{check_append, ChainStore, ChainTail, RunSummary};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

pub const CHAIN_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chain_links (
  run_id TEXT NOT NULL,
  sequence_index INTEGER NOT NULL CHECK (sequence_index >= 0),
  handshake_id TEXT NOT NULL UNIQUE,
  decision_id TEXT NOT NULL UNIQUE,
  source_stage TEXT NOT NULL,
  target_stage TEXT,
  decision_hash TEXT NOT NULL,
  parent_decision_hash TEXT,
  transition_reason TEXT NOT NULL,
  handshake_json TEXT NOT NULL,
  proof_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (run_id, sequence_index),
  UNIQUE (run_id, decision_hash)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_chain_links_single_root
  ON chain_links(run_id) WHERE parent_decision_hash IS NULL;
CREATE INDEX IF NOT EXISTS idx_chain_links_decision_hash
  ON chain_links(decision_hash);

CREATE TRIGGER IF NOT EXISTS trg_chain_links_no_update
BEFORE UPDATE ON chain_links
BEGIN
  SELECT RAISE(FAIL, 'chain_links is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_chain_links_no_delete
BEFORE DELETE ON chain_links
BEGIN
  SELECT RAISE(FAIL, 'chain_links is append-only');
END;
";

pub struct SqliteChainStore {
    conn: Connection,
}

impl SqliteChainStore {
    /// Open or create a `SQLite` chain database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Highest applied schema version, or `None` for an unmigrated database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be queried.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        let has_table: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite schema")?;
        if !has_table {
            return Ok(None);
        }

        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }
}

impl ChainStore for SqliteChainStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply chain schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CHAIN_SCHEMA_VERSION, now],
            )
            .context("failed to record chain migration")?;

        Ok(())
    }

    fn append_link(&self, handshake: &Handshake, proof: &DecisionProof) -> Result<ChainLink> {
        // IMMEDIATE takes the write lock before the tail is read, so the
        // tail check and the insert are atomic across connections.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        let tail = query_tail(&tx, handshake.run_id())?;
        let sequence_index = check_append(tail.as_ref(), handshake, proof)?;

        tx.execute(
            "INSERT INTO chain_links(
                run_id, sequence_index, handshake_id, decision_id,
                source_stage, target_stage, decision_hash, parent_decision_hash,
                transition_reason, handshake_json, proof_json, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                handshake.run_id().as_str(),
                to_sql_index(sequence_index)?,
                handshake.handshake_id().to_string(),
                proof.decision_id().to_string(),
                handshake.source_stage().as_str(),
                handshake.target_stage().map(StageName::as_str),
                handshake.decision_hash(),
                handshake.parent_decision_hash(),
                handshake.transition_reason(),
                serde_json::to_string(handshake).context("failed to serialize handshake")?,
                serde_json::to_string(proof).context("failed to serialize decision proof")?,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to append chain link")?;

        tx.commit().context("failed to commit append transaction")?;

        Ok(ChainLink {
            sequence_index,
            handshake: handshake.clone(),
            proof: proof.clone(),
        })
    }

    fn load_links(&self, run_id: &RunId) -> Result<Vec<ChainLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_index, handshake_json, proof_json
             FROM chain_links
             WHERE run_id = ?1
             ORDER BY sequence_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], parse_link_row)?;
        collect_rows(rows)
    }

    fn load_stored_links(&self, run_id: &RunId) -> Result<Vec<StoredLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_index, handshake_json, proof_json
             FROM chain_links
             WHERE run_id = ?1
             ORDER BY sequence_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], |row| {
            let sequence_index = from_sql_index(0, row.get(0)?)?;
            let handshake_raw: String = row.get(1)?;
            let proof_raw: String = row.get(2)?;
            Ok((sequence_index, handshake_raw, proof_raw))
        })?;

        let mut links = Vec::new();
        for (sequence_index, handshake_raw, proof_raw) in collect_rows(rows)? {
            let handshake = serde_json::from_str::<Handshake>(&handshake_raw)
                .map_err(|err| format!("handshake_json: {err}"));
            let proof = serde_json::from_str::<DecisionProof>(&proof_raw)
                .map_err(|err| format!("proof_json: {err}"));
            links.push(match (handshake, proof) {
                (Ok(handshake), Ok(proof)) => StoredLink::Decoded(ChainLink {
                    sequence_index,
                    handshake,
                    proof,
                }),
                (Err(detail), _) | (_, Err(detail)) => StoredLink::Undecodable {
                    sequence_index,
                    detail,
                },
            });
        }
        Ok(links)
    }

    fn tail(&self, run_id: &RunId) -> Result<Option<ChainTail>> {
        query_tail(&self.conn, run_id)
    }

    fn contains_decision(&self, run_id: &RunId, decision_hash: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM chain_links WHERE run_id = ?1 AND decision_hash = ?2)",
                params![run_id.as_str(), decision_hash],
                |row| row.get(0),
            )
            .context("failed to look up decision hash")
    }

    fn find_decision(&self, decision_hash: &str) -> Result<Option<ChainLink>> {
        self.conn
            .query_row(
                "SELECT sequence_index, handshake_json, proof_json
                 FROM chain_links
                 WHERE decision_hash = ?1
                 ORDER BY run_id ASC, sequence_index ASC
                 LIMIT 1",
                params![decision_hash],
                parse_link_row,
            )
            .optional()
            .context("failed to look up decision")
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.run_id, c.sequence_index, c.source_stage, c.decision_hash, c.target_stage
             FROM chain_links c
             JOIN (
               SELECT run_id, MAX(sequence_index) AS max_index
               FROM chain_links
               GROUP BY run_id
             ) t ON t.run_id = c.run_id AND t.max_index = c.sequence_index
             ORDER BY c.run_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let run_id_raw: String = row.get(0)?;
            let stage_raw: String = row.get(2)?;
            let target_stage: Option<String> = row.get(4)?;
            Ok(RunSummary {
                run_id: RunId::parse(run_id_raw).map_err(|err| conversion_error(0, &err))?,
                link_count: from_sql_index(1, row.get(1)?)? + 1,
                last_stage: StageName::parse(stage_raw).map_err(|err| conversion_error(2, &err))?,
                tail_decision_hash: row.get(3)?,
                terminal: target_stage.is_none(),
            })
        })?;
        collect_rows(rows)
    }
}

fn query_tail(conn: &Connection, run_id: &RunId) -> Result<Option<ChainTail>> {
    conn.query_row(
        "SELECT sequence_index, decision_hash, target_stage
         FROM chain_links
         WHERE run_id = ?1
         ORDER BY sequence_index DESC
         LIMIT 1",
        params![run_id.as_str()],
        |row| {
            let target_stage: Option<String> = row.get(2)?;
            Ok(ChainTail {
                sequence_index: from_sql_index(0, row.get(0)?)?,
                decision_hash: row.get(1)?,
                terminal: target_stage.is_none(),
            })
        },
    )
    .optional()
    .context("failed to read chain tail")
}

fn parse_link_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChainLink> {
    let handshake_raw: String = row.get(1)?;
    let proof_raw: String = row.get(2)?;
    Ok(ChainLink {
        sequence_index: from_sql_index(0, row.get(0)?)?,
        handshake: serde_json::from_str(&handshake_raw)
            .map_err(|err| conversion_error(1, &err))?,
        proof: serde_json::from_str(&proof_raw).map_err(|err| conversion_error(2, &err))?,
    })
}

fn to_sql_index(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("sequence_index {value} exceeds sqlite range"))
}

fn from_sql_index(column: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid sequence_index value: {value}"),
            )),
        )
    })
}

fn conversion_error(column: usize, err: &dyn std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
