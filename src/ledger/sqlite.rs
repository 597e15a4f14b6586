use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::error::LedgerError;
use crate::ledger::{Analysis, Ledger};

static SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/db/schema.sql"));

/// Analyses stored as JSON manifests in a SQLite database.
///
/// Every change is made inside a `dry_run` savepoint opened with the
/// connection; [`SqliteLedger::finish`] either releases it or rolls it back.
/// A ledger dropped without calling `finish` keeps none of its changes.
///
/// Only one process may use a database at a time. Nothing here locks across
/// processes, so concurrent monitors against the same file are unsupported.
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open (or create) `clusterflow.db` in `work_dir`
    pub fn open(work_dir: &Path) -> Result<Self, LedgerError> {
        let path = db_path(work_dir);
        if !path.exists() {
            info!("Creating new database {}", path.display())
        }
        Self::with_connection(Connection::open(&path)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        debug!("Creating dry run save point");
        conn.execute_batch("SAVEPOINT dry_run")?;
        Ok(SqliteLedger { conn })
    }

    /// Keep this session's changes, or discard them when `dry_run` is set
    pub fn finish(self, dry_run: bool) -> Result<(), LedgerError> {
        if dry_run {
            info!("--dry-run set, rolling back database state");
            self.conn.execute_batch("ROLLBACK TO dry_run; RELEASE dry_run")?;
        } else {
            info!("Releasing dry run save point");
            self.conn.execute_batch("RELEASE dry_run")?;
        }
        Ok(())
    }
}

pub fn db_path(work_dir: &Path) -> PathBuf {
    work_dir.join("clusterflow.db")
}

impl Ledger for SqliteLedger {
    fn analyses(&self) -> Result<Vec<Analysis>, LedgerError> {
        let mut stmt = self.conn.prepare("SELECT manifest FROM analysis ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut analyses = Vec::new();
        for row in rows {
            analyses.push(serde_json::from_str(&row?)?);
        }
        debug!("Loaded {} analyses from db", analyses.len());
        Ok(analyses)
    }

    fn get(&self, name: &str) -> Result<Analysis, LedgerError> {
        let manifest: Option<String> = self
            .conn
            .query_row("SELECT manifest FROM analysis WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        match manifest {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(LedgerError::UnknownAnalysis(name.to_string())),
        }
    }

    fn insert(&mut self, analysis: &Analysis) -> Result<(), LedgerError> {
        info!("Adding {} to db", analysis.name);
        let manifest = serde_json::to_string(analysis)?;
        let result = self.conn.execute(
            "INSERT INTO analysis (name, pipeline, state, manifest) VALUES (?1, ?2, ?3, ?4)",
            params![analysis.name, analysis.pipeline, analysis.state.as_str(), manifest],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                Err(LedgerError::DuplicateAnalysis(analysis.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update(&mut self, analysis: &Analysis) -> Result<(), LedgerError> {
        debug!("Updating {} with state {}", analysis.name, analysis.state);
        let manifest = serde_json::to_string(analysis)?;
        let changed = self.conn.execute(
            "UPDATE analysis SET pipeline = ?1, state = ?2, manifest = ?3, updated_at = CURRENT_TIMESTAMP \
             WHERE name = ?4",
            params![analysis.pipeline, analysis.state.as_str(), manifest, analysis.name],
        )?;
        if changed == 0 {
            return Err(LedgerError::UnknownAnalysis(analysis.name.clone()));
        }
        Ok(())
    }
}
