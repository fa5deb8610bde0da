//! Wires the gate, window, router, extractor and sink together.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::extract;
use crate::gate::RuleGate;
use crate::router::{
    AnalysisContext, AnalysisFailed, AnalysisOutput, AnalysisRequest, Analyzer, AnalyzerError,
    AnalyzerKind, Router,
};
use crate::sink::{
    save_analysis_retrying, save_anomaly_retrying, AnalysisOrigin, AnalysisRecord, AnomalyRecord,
    RecordSink, SinkError,
};
use crate::types::{Packet, RuleVerdict};
use crate::window::{RollingWindow, SharedWindow, TriggerEvent, WindowEntry, WindowStats};

/// Fixed prompts for the comprehensive fan-out
const COMPREHENSIVE: [(AnalyzerKind, &str); 3] = [
    (
        AnalyzerKind::Diagnostic,
        "Perform complete diagnostic analysis of this vehicle. Check all systems and sensors.",
    ),
    (
        AnalyzerKind::Maintenance,
        "Provide complete maintenance assessment and recommendations for this vehicle.",
    ),
    (
        AnalyzerKind::Performance,
        "Analyze overall performance, efficiency, and driving metrics for this vehicle.",
    ),
];

const OUTCOME_CHANNEL_SIZE: usize = 1_000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Analysis(#[from] AnalysisFailed),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to persist record: {0}")]
    Sink(#[from] SinkError),
    #[error("no anomalies in the window for vehicle {0}")]
    EmptyWindow(String),
}

/// A persisted analysis
#[derive(Debug, Clone)]
pub struct SavedAnalysis {
    pub record_id: String,
    pub record: AnalysisRecord,
}

/// Result of a background analysis, delivered on the outcome channel
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub vehicle_id: String,
    pub origin: AnalysisOrigin,
    pub result: Result<SavedAnalysis, PipelineError>,
}

/// What happened to one ingested packet
#[derive(Debug, Clone)]
pub struct PacketReport {
    pub sequence: u64,
    pub vehicle_id: String,
    pub verdict: RuleVerdict,
    pub anomaly_id: Option<String>,
    pub triggered: bool,
}

/// Per-kind results of [`Pipeline::comprehensive`]
#[derive(Debug)]
pub struct ComprehensiveReport {
    pub vehicle_id: String,
    pub diagnostic: Result<SavedAnalysis, PipelineError>,
    pub maintenance: Result<SavedAnalysis, PipelineError>,
    pub performance: Result<SavedAnalysis, PipelineError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub packets_processed: u64,
    pub anomalies: u64,
    pub analyses_dispatched: u64,
    pub window: WindowStats,
}

#[derive(Default)]
struct Counters {
    packets: AtomicU64,
    anomalies: AtomicU64,
    dispatched: AtomicU64,
}

struct Shared {
    gate: RuleGate,
    window: SharedWindow,
    router: Router,
    sink: Arc<dyn RecordSink>,
    default_vehicle_id: String,
    max_age: Option<Duration>,
    history_len: usize,
    outcomes: mpsc::Sender<AnalysisOutcome>,
    counters: Counters,
}

/// Cheap to clone; all clones share one window and sink.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Shared>,
}

impl Pipeline {
    /// Build a pipeline and the receiver for background analysis outcomes.
    pub fn new(
        config: &Config,
        analyzer: Arc<dyn Analyzer>,
        sink: Arc<dyn RecordSink>,
    ) -> (Self, mpsc::Receiver<AnalysisOutcome>) {
        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_SIZE);
        let max_age = match config.window.max_age_secs {
            0 => None,
            secs => Some(Duration::seconds(secs as i64)),
        };

        let shared = Shared {
            gate: RuleGate::new(&config.rules),
            window: SharedWindow::new(RollingWindow::from_config(&config.window)),
            router: Router::new(analyzer),
            sink,
            default_vehicle_id: config.agent.vehicle_id.clone(),
            max_age,
            history_len: config.ingest.history_len,
            outcomes: tx,
            counters: Counters::default(),
        };

        (Self { inner: Arc::new(shared) }, rx)
    }

    pub fn window(&self) -> &SharedWindow {
        &self.inner.window
    }

    /// Feed packets through the gate one at a time, optionally pacing and
    /// replaying them. Stops at the first persistence failure.
    ///
    /// Rate history is kept per vehicle and cleared at the start of every
    /// pass, so a replay never regresses over the previous pass's tail.
    pub async fn run(
        &self,
        packets: &[Packet],
        interval: std::time::Duration,
        cycle: bool,
    ) -> Result<(), PipelineError> {
        if packets.is_empty() {
            tracing::warn!("No packets to ingest");
            return Ok(());
        }

        let mut histories: HashMap<String, VecDeque<Packet>> = HashMap::new();
        loop {
            histories.clear();
            for packet in packets {
                let vehicle_id = packet
                    .vehicle_id()
                    .unwrap_or(&self.inner.default_vehicle_id)
                    .to_string();
                let history = histories.entry(vehicle_id).or_default();
                let report = self
                    .process(packet.clone(), history.make_contiguous())
                    .await?;
                if report.triggered {
                    tracing::info!(
                        vehicle_id = %report.vehicle_id,
                        sequence = report.sequence,
                        "Window threshold reached, root-cause analysis dispatched"
                    );
                }

                history.push_back(packet.clone());
                while history.len() > self.inner.history_len {
                    history.pop_front();
                }

                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }

            if !cycle {
                tracing::info!(packets = packets.len(), "Packet stream exhausted");
                return Ok(());
            }
            tracing::debug!("Replaying packet stream from the start");
        }
    }

    /// Gate one packet, persist it if anomalous and append it to the window.
    ///
    /// A threshold crossing spawns the automatic root-cause analysis; its
    /// result arrives on the outcome channel.
    pub async fn process(&self, packet: Packet, history: &[Packet]) -> Result<PacketReport, PipelineError> {
        let inner = &self.inner;
        let now = Utc::now();

        if let Some(max_age) = inner.max_age {
            let expired = inner.window.expire(now - max_age);
            if expired > 0 {
                tracing::debug!(expired, "Expired stale window entries");
            }
        }

        inner.counters.packets.fetch_add(1, Ordering::Relaxed);
        let vehicle_id = packet
            .vehicle_id()
            .unwrap_or(&inner.default_vehicle_id)
            .to_string();
        let verdict = inner.gate.evaluate(&packet, history);

        let mut report = PacketReport {
            sequence: packet.sequence,
            vehicle_id: vehicle_id.clone(),
            verdict: verdict.clone(),
            anomaly_id: None,
            triggered: false,
        };
        if !verdict.is_anomalous {
            return Ok(report);
        }

        inner.counters.anomalies.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            vehicle_id = %vehicle_id,
            sequence = packet.sequence,
            rules = ?verdict.rule_ids(),
            "Anomalous packet"
        );

        let record = AnomalyRecord {
            vehicle_id: vehicle_id.clone(),
            observed_at: now,
            packet,
            verdict,
        };
        report.anomaly_id = Some(save_anomaly_retrying(inner.sink.as_ref(), &record).await?);

        let entry = WindowEntry {
            vehicle_id,
            observed_at: record.observed_at,
            packet: record.packet,
            verdict: record.verdict,
        };
        if let Some(event) = inner.window.append(entry) {
            report.triggered = true;
            self.dispatch(event);
        }

        Ok(report)
    }

    /// Run the automatic analysis for a trigger without blocking ingestion.
    fn dispatch(&self, event: TriggerEvent) {
        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let pipeline = self.clone();

        tokio::spawn(async move {
            let vehicle_id = event.vehicle_id.clone();
            let request = pipeline.inner.router.trigger_request(event);
            let result = pipeline.analyze_and_store(request, AnalysisOrigin::Trigger).await;

            let outcome = AnalysisOutcome {
                vehicle_id,
                origin: AnalysisOrigin::Trigger,
                result,
            };
            if let Err(e) = pipeline.inner.outcomes.send(outcome).await {
                tracing::error!(vehicle_id = %e.0.vehicle_id, "Outcome receiver dropped; analysis result lost");
            }
        });
    }

    /// Ad hoc question, routed by keyword and sent with the vehicle's
    /// current window entries.
    pub async fn query(&self, vehicle_id: &str, text: &str) -> Result<SavedAnalysis, PipelineError> {
        let request = self
            .inner
            .router
            .query_request(vehicle_id, text, self.vehicle_entries(vehicle_id));
        tracing::info!(vehicle_id = %vehicle_id, kind = %request.kind, "Routing query");
        self.analyze_and_store(request, AnalysisOrigin::Query).await
    }

    /// Root-cause analysis over the vehicle's current window entries.
    /// Leaves the trigger state untouched.
    pub async fn trigger_rca_capa(&self, vehicle_id: &str) -> Result<SavedAnalysis, PipelineError> {
        let entries = self.vehicle_entries(vehicle_id);
        if entries.is_empty() {
            return Err(PipelineError::EmptyWindow(vehicle_id.to_string()));
        }

        let request = self.inner.router.trigger_request(TriggerEvent {
            vehicle_id: vehicle_id.to_string(),
            entries,
        });
        self.analyze_and_store(request, AnalysisOrigin::Manual).await
    }

    /// Diagnostic, maintenance and performance analyses run concurrently,
    /// each without fallback and each with the vehicle's window entries.
    /// One kind failing does not affect the others.
    pub async fn comprehensive(&self, vehicle_id: &str) -> ComprehensiveReport {
        let window = self.vehicle_entries(vehicle_id);
        let [diagnostic, maintenance, performance] = COMPREHENSIVE.map(|(kind, prompt)| AnalysisRequest {
            vehicle_id: vehicle_id.to_string(),
            kind,
            context: AnalysisContext::Query {
                query: prompt.to_string(),
                window: window.clone(),
            },
        });

        let (diagnostic, maintenance, performance) = tokio::join!(
            self.analyze_once_and_store(diagnostic),
            self.analyze_once_and_store(maintenance),
            self.analyze_once_and_store(performance),
        );

        ComprehensiveReport {
            vehicle_id: vehicle_id.to_string(),
            diagnostic,
            maintenance,
            performance,
        }
    }

    fn vehicle_entries(&self, vehicle_id: &str) -> Vec<WindowEntry> {
        self.inner
            .window
            .snapshot()
            .into_iter()
            .filter(|e| e.vehicle_id == vehicle_id)
            .collect()
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.inner.counters;
        PipelineStats {
            packets_processed: counters.packets.load(Ordering::Relaxed),
            anomalies: counters.anomalies.load(Ordering::Relaxed),
            analyses_dispatched: counters.dispatched.load(Ordering::Relaxed),
            window: self.inner.window.stats(),
        }
    }

    async fn analyze_and_store(
        &self,
        request: AnalysisRequest,
        origin: AnalysisOrigin,
    ) -> Result<SavedAnalysis, PipelineError> {
        let query = request.context.query_text().map(String::from);
        let output = self.inner.router.analyze(request).await?;
        self.store(output, origin, query).await
    }

    async fn analyze_once_and_store(&self, request: AnalysisRequest) -> Result<SavedAnalysis, PipelineError> {
        let query = request.context.query_text().map(String::from);
        let output = self.inner.router.analyze_once(request).await?;
        self.store(output, AnalysisOrigin::Comprehensive, query).await
    }

    /// Extract in the form of the kind that actually answered, then persist.
    async fn store(
        &self,
        output: AnalysisOutput,
        origin: AnalysisOrigin,
        query: Option<String>,
    ) -> Result<SavedAnalysis, PipelineError> {
        let structured = extract::extract(&output.text, output.answered_by);
        if !structured.parsed() {
            tracing::warn!(
                vehicle_id = %output.vehicle_id,
                kind = %output.answered_by,
                "Analyzer output had no recognizable table"
            );
        }

        let record = AnalysisRecord {
            vehicle_id: output.vehicle_id,
            origin,
            requested: output.requested,
            answered_by: output.answered_by,
            query,
            raw_text: output.text,
            record: structured,
        };
        let record_id = save_analysis_retrying(self.inner.sink.as_ref(), &record).await?;

        tracing::info!(
            vehicle_id = %record.vehicle_id,
            record_id = %record_id,
            kind = %record.kind(),
            answered_by = %record.answered_by,
            "Analysis stored"
        );
        Ok(SavedAnalysis { record_id, record })
    }
}
