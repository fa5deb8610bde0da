//! Chooses which analyzer variant answers a request and calls it with a
//! single bounded fallback.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::window::{TriggerEvent, WindowEntry};

/// Specialized analyzer variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Diagnostic,
    Maintenance,
    Performance,
    RcaCapa,
}

impl AnalyzerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerKind::Diagnostic => "diagnostic",
            AnalyzerKind::Maintenance => "maintenance",
            AnalyzerKind::Performance => "performance",
            AnalyzerKind::RcaCapa => "rca_capa",
        }
    }
}

impl std::fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the analyzer is asked about
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AnalysisContext {
    /// A question plus the vehicle's current window entries, oldest first
    Query { query: String, window: Vec<WindowEntry> },
    Window(Vec<WindowEntry>),
}

impl AnalysisContext {
    pub fn query_text(&self) -> Option<&str> {
        match self {
            AnalysisContext::Query { query, .. } => Some(query),
            AnalysisContext::Window(_) => None,
        }
    }

    pub fn entries(&self) -> &[WindowEntry] {
        match self {
            AnalysisContext::Query { window, .. } => window,
            AnalysisContext::Window(entries) => entries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub vehicle_id: String,
    pub kind: AnalyzerKind,
    pub context: AnalysisContext,
}

impl AnalysisRequest {
    fn with_kind(&self, kind: AnalyzerKind) -> Self {
        Self { kind, ..self.clone() }
    }
}

/// Classified analyzer failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    #[error("analyzer rate limited: {0}")]
    RateLimited(String),
    #[error("analyzer timed out: {0}")]
    Timeout(String),
    #[error("analyzer upstream error: {0}")]
    Upstream(String),
    #[error("analyzer returned malformed output: {0}")]
    Malformed(String),
}

/// Both the primary call and its fallback failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("analysis failed after fallback to {fallback_kind}: {reason}")]
pub struct AnalysisFailed {
    pub requested: AnalyzerKind,
    pub fallback_kind: AnalyzerKind,
    /// Error from the first attempt
    pub primary: AnalyzerError,
    /// Error from the fallback attempt, surfaced unmodified
    pub reason: AnalyzerError,
}

/// The external text-generation collaborator.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, request: &AnalysisRequest) -> Result<String, AnalyzerError>;
}

/// Successful analysis, possibly answered by the fallback kind
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub vehicle_id: String,
    pub requested: AnalyzerKind,
    pub answered_by: AnalyzerKind,
    pub attempts: u8,
    pub text: String,
}

/// One row of the ad hoc routing table
pub struct RouteRule {
    pub kind: AnalyzerKind,
    pub keywords: &'static [&'static str],
}

/// Checked top to bottom; the first group with any substring match wins.
pub const ROUTING_TABLE: &[RouteRule] = &[
    RouteRule {
        kind: AnalyzerKind::Maintenance,
        keywords: &["maintenance", "service", "schedule", "when should", "oil", "fluid", "check", "replace"],
    },
    RouteRule {
        kind: AnalyzerKind::Performance,
        keywords: &["performance", "efficiency", "fuel", "range", "speed", "acceleration", "how's", "how is"],
    },
];

pub const DEFAULT_KIND: AnalyzerKind = AnalyzerKind::Diagnostic;
pub const FALLBACK_KIND: AnalyzerKind = AnalyzerKind::Diagnostic;

/// Classify an ad hoc query
pub fn route(query: &str) -> AnalyzerKind {
    let query = query.to_lowercase();
    ROUTING_TABLE
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| query.contains(k)))
        .map(|rule| rule.kind)
        .unwrap_or(DEFAULT_KIND)
}

pub struct Router {
    analyzer: Arc<dyn Analyzer>,
}

impl Router {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }

    /// Ad hoc request routed by keyword, carrying the vehicle's window entries
    pub fn query_request(&self, vehicle_id: &str, query: &str, window: Vec<WindowEntry>) -> AnalysisRequest {
        AnalysisRequest {
            vehicle_id: vehicle_id.to_string(),
            kind: route(query),
            context: AnalysisContext::Query {
                query: query.to_string(),
                window,
            },
        }
    }

    /// Automatic requests always target root-cause analysis
    pub fn trigger_request(&self, event: TriggerEvent) -> AnalysisRequest {
        AnalysisRequest {
            vehicle_id: event.vehicle_id,
            kind: AnalyzerKind::RcaCapa,
            context: AnalysisContext::Window(event.entries),
        }
    }

    /// Call the analyzer; on any error retry exactly once with the fallback kind.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutput, AnalysisFailed> {
        let requested = request.kind;

        let primary = match self.analyzer.call(&request).await {
            Ok(text) => {
                return Ok(AnalysisOutput {
                    vehicle_id: request.vehicle_id,
                    requested,
                    answered_by: requested,
                    attempts: 1,
                    text,
                });
            }
            Err(e) => e,
        };

        tracing::warn!(
            analyzer = self.analyzer.name(),
            kind = %requested,
            fallback = %FALLBACK_KIND,
            error = %primary,
            "Analyzer call failed, retrying once with fallback"
        );

        let fallback_request = request.with_kind(FALLBACK_KIND);
        match self.analyzer.call(&fallback_request).await {
            Ok(text) => Ok(AnalysisOutput {
                vehicle_id: fallback_request.vehicle_id,
                requested,
                answered_by: FALLBACK_KIND,
                attempts: 2,
                text,
            }),
            Err(reason) => {
                tracing::error!(
                    analyzer = self.analyzer.name(),
                    kind = %requested,
                    error = %reason,
                    "Fallback analyzer call failed"
                );
                Err(AnalysisFailed {
                    requested,
                    fallback_kind: FALLBACK_KIND,
                    primary,
                    reason,
                })
            }
        }
    }

    /// Call the analyzer once with no fallback
    pub async fn analyze_once(&self, request: AnalysisRequest) -> Result<AnalysisOutput, AnalyzerError> {
        let text = self.analyzer.call(&request).await?;
        Ok(AnalysisOutput {
            vehicle_id: request.vehicle_id,
            requested: request.kind,
            answered_by: request.kind,
            attempts: 1,
            text,
        })
    }
}
