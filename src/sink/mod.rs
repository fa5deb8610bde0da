pub mod sqlite;

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::StructuredRecord;
use crate::router::AnalyzerKind;
use crate::types::{Packet, RuleVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Anomaly,
    Analysis,
    RcaCapa,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Anomaly => "anomaly",
            RecordKind::Analysis => "analysis",
            RecordKind::RcaCapa => "rca_capa",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anomaly" => Ok(RecordKind::Anomaly),
            "analysis" => Ok(RecordKind::Analysis),
            "rca_capa" => Ok(RecordKind::RcaCapa),
            other => Err(SinkError::Backend(format!("unknown record kind: {}", other))),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink backend error: {0}")]
    Backend(String),
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sink task failed: {0}")]
    Task(String),
}

/// A packet the rule gate flagged, with its verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub vehicle_id: String,
    pub observed_at: DateTime<Utc>,
    pub packet: Packet,
    pub verdict: RuleVerdict,
}

/// What asked for an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOrigin {
    /// Free-text question
    Query,
    /// The rolling window crossed its threshold
    Trigger,
    /// Explicit root-cause request over the current window
    Manual,
    /// One kind of a fan-out over all specialized analyzers
    Comprehensive,
}

/// An analyzer reply and the record extracted from it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub vehicle_id: String,
    pub origin: AnalysisOrigin,
    pub requested: AnalyzerKind,
    pub answered_by: AnalyzerKind,
    /// Ad hoc query text; absent for window-driven analyses
    pub query: Option<String>,
    pub raw_text: String,
    pub record: StructuredRecord,
}

impl AnalysisRecord {
    /// Root-cause requests are stored as `rca_capa` even when the fallback answered.
    pub fn kind(&self) -> RecordKind {
        match self.requested {
            AnalyzerKind::RcaCapa => RecordKind::RcaCapa,
            _ => RecordKind::Analysis,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    Anomaly(AnomalyRecord),
    Analysis(AnalysisRecord),
}

/// A persisted record as returned by [`RecordSink::list`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub kind: RecordKind,
    pub vehicle_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: RecordPayload,
}

impl StoredRecord {
    fn new(payload: RecordPayload) -> Self {
        let (kind, vehicle_id) = match &payload {
            RecordPayload::Anomaly(a) => (RecordKind::Anomaly, a.vehicle_id.clone()),
            RecordPayload::Analysis(a) => (a.kind(), a.vehicle_id.clone()),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            vehicle_id,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn oem_owners(&self) -> &[String] {
        match &self.payload {
            RecordPayload::Analysis(a) => a.record.oem_owners(),
            RecordPayload::Anomaly(_) => &[],
        }
    }
}

/// Filter for [`RecordSink::list`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub vehicle_id: Option<String>,
    pub kind: Option<RecordKind>,
    /// Only records naming this owner among their corrective actions
    pub oem_owner: Option<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn oem_owner(mut self, owner: impl Into<String>) -> Self {
        self.oem_owner = Some(owner.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        self.vehicle_id.as_ref().map_or(true, |v| *v == record.vehicle_id)
            && self.kind.map_or(true, |k| k == record.kind)
            && self
                .oem_owner
                .as_ref()
                .map_or(true, |o| record.oem_owners().contains(o))
    }
}

/// Durable store for verdicts and structured records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Persist an anomaly and return its identifier.
    async fn save_anomaly(&self, record: &AnomalyRecord) -> Result<String, SinkError>;

    /// Persist an analysis and return its identifier.
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<String, SinkError>;

    /// Matching records, newest first
    async fn list(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, SinkError>;
}

/// Save an anomaly, retrying once before the error propagates.
pub async fn save_anomaly_retrying(
    sink: &dyn RecordSink,
    record: &AnomalyRecord,
) -> Result<String, SinkError> {
    match sink.save_anomaly(record).await {
        Ok(id) => Ok(id),
        Err(e) => {
            tracing::warn!(sink = sink.name(), vehicle_id = %record.vehicle_id, error = %e, "Anomaly save failed, retrying once");
            sink.save_anomaly(record).await
        }
    }
}

/// Save an analysis, retrying once before the error propagates.
pub async fn save_analysis_retrying(
    sink: &dyn RecordSink,
    record: &AnalysisRecord,
) -> Result<String, SinkError> {
    match sink.save_analysis(record).await {
        Ok(id) => Ok(id),
        Err(e) => {
            tracing::warn!(sink = sink.name(), vehicle_id = %record.vehicle_id, kind = %record.kind(), error = %e, "Analysis save failed, retrying once");
            sink.save_analysis(record).await
        }
    }
}

/// Process-local sink, newest records last in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<RwLock<Vec<StoredRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, record: StoredRecord) -> Result<String, SinkError> {
        let id = record.id.clone();
        self.inner
            .write()
            .map_err(|_| SinkError::Backend("memory sink lock poisoned".into()))?
            .push(record);
        Ok(id)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save_anomaly(&self, record: &AnomalyRecord) -> Result<String, SinkError> {
        self.push(StoredRecord::new(RecordPayload::Anomaly(record.clone())))
    }

    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<String, SinkError> {
        self.push(StoredRecord::new(RecordPayload::Analysis(record.clone())))
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, SinkError> {
        let records = self
            .inner
            .read()
            .map_err(|_| SinkError::Backend("memory sink lock poisoned".into()))?;
        let matching = records.iter().rev().filter(|r| query.matches(r)).cloned();
        Ok(match query.limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }
}
