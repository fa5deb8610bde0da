//! SQLite-backed record sink.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use super::{
    AnalysisRecord, AnomalyRecord, RecordPayload, RecordQuery, RecordSink, SinkError, StoredRecord,
};

pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Create tables and indexes if they do not exist yet.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            vehicle_id TEXT NOT NULL,
            record_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS record_owners (
            record_id TEXT NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            oem_owner TEXT NOT NULL,
            PRIMARY KEY (record_id, oem_owner)
        );

        CREATE INDEX IF NOT EXISTS idx_records_vehicle_kind ON records(vehicle_id, kind);
        CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at);
        CREATE INDEX IF NOT EXISTS idx_record_owners_owner ON record_owners(oem_owner);",
    )
}

#[derive(Clone)]
pub struct SqliteSink {
    pool: Pool,
}

impl SqliteSink {
    /// Open (or create) the database file and run migrations.
    pub fn open(path: &str, busy_timeout_ms: u64) -> Result<Self> {
        let pragmas = format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            busy_timeout_ms
        );
        let manager = SqliteConnectionManager::file(path).with_init(move |c| c.execute_batch(&pragmas));

        let pool = R2D2Pool::new(manager)
            .with_context(|| format!("Failed to open record database: {}", path))?;
        let conn = pool.get().context("Failed to get database connection")?;
        migrate(&conn).context("Failed to migrate record database")?;

        tracing::info!(path = %path, "Record database ready");
        Ok(Self { pool })
    }

    async fn insert(&self, record: StoredRecord) -> Result<String, SinkError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<String, SinkError> {
            let json = serde_json::to_string(&record)?;
            let created_at = record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true);

            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO records (id, kind, vehicle_id, record_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![record.id, record.kind.as_str(), record.vehicle_id, json, created_at],
            )?;
            for owner in record.oem_owners() {
                tx.execute(
                    "INSERT OR IGNORE INTO record_owners (record_id, oem_owner) VALUES (?1, ?2)",
                    rusqlite::params![record.id, owner],
                )?;
            }
            tx.commit()?;

            Ok(record.id)
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))?
    }
}

/// Build the filtered SELECT and its positional parameters.
fn select_sql(query: &RecordQuery) -> (String, Vec<String>) {
    let mut sql = String::from("SELECT record_json FROM records r WHERE 1 = 1");
    let mut params = Vec::new();

    if let Some(vehicle_id) = &query.vehicle_id {
        params.push(vehicle_id.clone());
        sql.push_str(&format!(" AND r.vehicle_id = ?{}", params.len()));
    }
    if let Some(kind) = query.kind {
        params.push(kind.as_str().to_string());
        sql.push_str(&format!(" AND r.kind = ?{}", params.len()));
    }
    if let Some(owner) = &query.oem_owner {
        params.push(owner.clone());
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM record_owners o WHERE o.record_id = r.id AND o.oem_owner = ?{})",
            params.len()
        ));
    }
    sql.push_str(" ORDER BY r.created_at DESC, r.seq DESC");
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    (sql, params)
}

#[async_trait]
impl RecordSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save_anomaly(&self, record: &AnomalyRecord) -> Result<String, SinkError> {
        self.insert(StoredRecord::new(RecordPayload::Anomaly(record.clone()))).await
    }

    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<String, SinkError> {
        self.insert(StoredRecord::new(RecordPayload::Analysis(record.clone()))).await
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, SinkError> {
        let pool = self.pool.clone();
        let (sql, params) = select_sql(query);

        tokio::task::spawn_blocking(move || -> Result<Vec<StoredRecord>, SinkError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })?;

            let mut records = Vec::new();
            for json in rows {
                records.push(serde_json::from_str(&json?)?);
            }
            Ok(records)
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))?
    }
}
