//! Turns an analyzer's free-form reply into a structured record.
//!
//! Extraction never fails. Text that does not contain a qualifying table
//! yields a record with empty lists and `parsed == false`, which callers
//! must use to tell "could not parse" apart from "no findings".

pub mod metrics;
pub mod table;
pub mod vehicle;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::router::AnalyzerKind;
use table::{Row, TableBlock};

/// Primary-key values treated as "no row"
pub const PLACEHOLDERS: &[&str] = &["n/a", "na", "-", "--", "tbd", "none", "null", "...", "…"];

const CATEGORY: &[&str] = &["category"];
const SUMMARY: &[&str] = &["summary", "findings", "finding"];
const KEY_VALUES: &[&str] = &["key values", "key value", "key metrics", "values"];
const SEVERITY: &[&str] = &["severity", "status"];

const RCA_HEADING: &[&str] = &["root cause", "rca"];
const CAPA_HEADING: &[&str] = &["corrective", "preventive", "capa"];

const FAILURE_COMPONENT: &[&str] = &["failure component", "component"];
const PRIMARY_CAUSE: &[&str] = &["primary cause", "root cause", "cause"];
const CONTRIBUTING: &[&str] = &["contributing factors", "contributing factor"];
const EVIDENCE: &[&str] = &["evidence"];

const ACTION_TYPE: &[&str] = &["action type", "type"];
const ACTION_ITEM: &[&str] = &["action item", "action"];
const TIMELINE: &[&str] = &["timeline"];
const EXPECTED_OUTCOME: &[&str] = &["expected outcome", "outcome"];
const OEM_OWNER: &[&str] = &["oem owner", "owner"];

static SAFETY_CRITICALITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)safety[ _-]criticality[*_ \t]*:[*_ \t]*([^\n|]+)").expect("valid pattern")
});

/// One row of a single-table analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub summary: String,
    /// Copied verbatim, status glyphs included
    pub severity: String,
    pub key_values: String,
    pub metrics: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub vehicle_id: Option<String>,
    pub summary: Option<String>,
    pub categories: Vec<Category>,
    pub severity_summary: BTreeMap<String, String>,
    pub parsed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaRow {
    pub component: String,
    pub primary_cause: String,
    pub contributing_factors: String,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapaRow {
    pub action_type: String,
    pub action_item: String,
    pub timeline: String,
    pub expected_outcome: String,
    pub oem_owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RcaCapaRecord {
    pub vehicle_id: Option<String>,
    pub rca_rows: Vec<RcaRow>,
    pub capa_rows: Vec<CapaRow>,
    /// `None` when no root-cause table was found
    pub affected_components: Option<Vec<String>>,
    pub oem_owners: Vec<String>,
    pub safety_criticality: Option<String>,
    pub parsed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum StructuredRecord {
    Categories(CategoryRecord),
    RcaCapa(RcaCapaRecord),
}

impl StructuredRecord {
    pub fn vehicle_id(&self) -> Option<&str> {
        match self {
            StructuredRecord::Categories(r) => r.vehicle_id.as_deref(),
            StructuredRecord::RcaCapa(r) => r.vehicle_id.as_deref(),
        }
    }

    pub fn parsed(&self) -> bool {
        match self {
            StructuredRecord::Categories(r) => r.parsed,
            StructuredRecord::RcaCapa(r) => r.parsed,
        }
    }

    pub fn oem_owners(&self) -> &[String] {
        match self {
            StructuredRecord::Categories(_) => &[],
            StructuredRecord::RcaCapa(r) => &r.oem_owners,
        }
    }
}

/// Extract using the form the given analyzer kind answers in.
pub fn extract(text: &str, kind: AnalyzerKind) -> StructuredRecord {
    let record = match kind {
        AnalyzerKind::RcaCapa => StructuredRecord::RcaCapa(extract_rca_capa(text)),
        _ => StructuredRecord::Categories(extract_categories(text)),
    };
    if !record.parsed() {
        tracing::debug!(kind = %kind, chars = text.len(), "No qualifying table in analyzer output");
    }
    record
}

/// Single-table form: `Category | Summary | Key Values | Severity`.
pub fn extract_categories(text: &str) -> CategoryRecord {
    let mut record = CategoryRecord {
        vehicle_id: vehicle::vehicle_id(text),
        summary: vehicle::summary(text),
        ..Default::default()
    };

    let blocks = table::find_tables(text);
    let Some(block) = blocks.iter().find(|b| b.has_column(CATEGORY)) else {
        return record;
    };
    record.parsed = true;

    for row in keyed_rows(block, CATEGORY) {
        let name = row.get(CATEGORY);
        if record.categories.iter().any(|c| c.name == name) {
            continue;
        }
        let key_values = row.get(KEY_VALUES);
        let category = Category {
            summary: row.get(SUMMARY),
            severity: row.get(SEVERITY),
            metrics: metrics::explode(&key_values),
            key_values,
            name,
        };
        record
            .severity_summary
            .insert(category.name.clone(), category.severity.clone());
        record.categories.push(category);
    }

    record
}

/// Dual-table form: a root-cause table and a corrective/preventive action
/// table, told apart by the heading above each.
pub fn extract_rca_capa(text: &str) -> RcaCapaRecord {
    let mut record = RcaCapaRecord {
        vehicle_id: vehicle::vehicle_id(text),
        safety_criticality: safety_criticality(text),
        ..Default::default()
    };

    let blocks = table::find_tables(text);
    let mut rca_block = None;
    let mut capa_block = None;
    for block in &blocks {
        let Some(heading) = block.heading.as_deref() else { continue };
        if heading_matches(heading, RCA_HEADING) {
            rca_block.get_or_insert(block);
        } else if heading_matches(heading, CAPA_HEADING) {
            capa_block.get_or_insert(block);
        }
    }
    record.parsed = rca_block.is_some() || capa_block.is_some();

    if let Some(block) = rca_block {
        let mut components: Vec<String> = Vec::new();
        for row in keyed_rows(block, FAILURE_COMPONENT) {
            let component = row.get(FAILURE_COMPONENT);
            if components.contains(&component) {
                continue;
            }
            components.push(component.clone());
            record.rca_rows.push(RcaRow {
                component,
                primary_cause: row.get(PRIMARY_CAUSE),
                contributing_factors: row.get(CONTRIBUTING),
                evidence: row.get(EVIDENCE),
            });
        }
        record.affected_components = Some(components);
    }

    if let Some(block) = capa_block {
        for row in keyed_rows(block, ACTION_ITEM) {
            let action_item = row.get(ACTION_ITEM);
            if record.capa_rows.iter().any(|c| c.action_item == action_item) {
                continue;
            }
            let oem_owner = row.get(OEM_OWNER);
            if !is_placeholder(&oem_owner) && !record.oem_owners.contains(&oem_owner) {
                record.oem_owners.push(oem_owner.clone());
            }
            record.capa_rows.push(CapaRow {
                action_type: row.get(ACTION_TYPE),
                action_item,
                timeline: row.get(TIMELINE),
                expected_outcome: row.get(EXPECTED_OUTCOME),
                oem_owner,
            });
        }
    }

    record
}

/// Rows whose primary key is present and not a placeholder
fn keyed_rows(block: &TableBlock, key: &[&str]) -> Vec<Row> {
    block
        .records()
        .into_iter()
        .filter(|row| !is_placeholder(&row.get(key)))
        .collect()
}

pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.is_empty()
        || v.chars().all(|c| c == '-' || c == ':' || c == '_' || c == '—' || c == '–')
        || PLACEHOLDERS.iter().any(|p| v.eq_ignore_ascii_case(p))
}

/// Remove markdown emphasis markers and surrounding whitespace.
pub fn strip_emphasis(s: &str) -> String {
    s.replace("**", "")
        .replace("__", "")
        .trim()
        .trim_matches(|c| c == '*' || c == '_' || c == '`')
        .trim()
        .to_string()
}

/// Whole-word keyword match, so "rca" does not match inside "circa".
fn heading_matches(heading: &str, keywords: &[&str]) -> bool {
    let words: Vec<String> = heading
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let padded = format!(" {} ", words.join(" "));
    keywords.iter().any(|k| padded.contains(&format!(" {} ", k)))
}

fn safety_criticality(text: &str) -> Option<String> {
    let raw = SAFETY_CRITICALITY.captures(text)?.get(1)?.as_str();
    let value = strip_emphasis(raw);
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_ROWS: &str = "\
**Vehicle ID:** VH001 – *Analysis Report*

| Category | Summary | Key Values | Severity |
|----------|---------|------------|----------|
| **Battery** | Good overall health; minor imbalance | SOC 67.68 %, Pack 371.1 V, Temp spread 5.7 °C | ⚠️ Warning (temperature spread) |
| **Brake System** | Pad wear approaching critical | Pad wear 72 %, Disc 138.4 °C | 🔴 Critical |
";

    const RCA_CAPA: &str = "\
**Vehicle ID:** default – Electric Vehicle

Safety Criticality: **High**

## ROOT CAUSE ANALYSIS (RCA)

| Failure Component | Primary Cause | Contributing Factors | Evidence |
|------|------|------|------|
| Brake System | Compound degradation | High-speed thermal cycling | Pad wear 72% |
| N/A | - | - | - |
| Battery Pack | Dendrite formation | Deep cycling | SOC variance 8% |

## CORRECTIVE AND PREVENTIVE ACTIONS (CAPA)

| Action Type | Action Item | Timeline | Expected Outcome | OEM Owner |
|------|------|------|------|------|
| Corrective | Replace brake pads | 48hrs | Thermal fade <3% | Brake System Team |
| Preventive | Re-engineer anode | 3 weeks | Cycle life +60% | Battery Team |
| Preventive | Coat brake discs | 3 weeks | First-failure -45% | Brake System Team |
| Preventive | TBD | - | - | Quality Team |
";

    #[test]
    fn well_formed_two_row_table() {
        let r = extract_categories(TWO_ROWS);
        assert!(r.parsed);
        assert_eq!(r.vehicle_id.as_deref(), Some("VH001"));
        assert_eq!(r.summary.as_deref(), Some("Analysis Report"));
        assert_eq!(r.categories.len(), 2);

        let battery = &r.categories[0];
        assert_eq!(battery.name, "Battery");
        assert_eq!(battery.summary, "Good overall health; minor imbalance");
        assert_eq!(battery.severity, "⚠️ Warning (temperature spread)");
        assert_eq!(battery.metrics.len(), 3);
        assert_eq!(battery.metrics["SOC"], "67.68 %");
        assert_eq!(battery.metrics["Pack"], "371.1 V");
        assert_eq!(battery.metrics["Temp spread"], "5.7 °C");

        let brakes = &r.categories[1];
        assert_eq!(brakes.name, "Brake System");
        assert_eq!(brakes.severity, "🔴 Critical");
        assert_eq!(brakes.metrics["Pad wear"], "72 %");
        assert_eq!(r.severity_summary["Brake System"], "🔴 Critical");
    }

    #[test]
    fn plain_prose_is_unparsed_not_an_error() {
        let r = extract_categories("The vehicle looks fine overall. Nothing to report.");
        assert!(!r.parsed);
        assert!(r.categories.is_empty());
        assert_eq!(r.vehicle_id, None);
    }

    #[test]
    fn placeholder_rows_are_dropped() {
        let text = "\
| Category | Summary | Key Values | Severity |
|---|---|---|---|
| N/A | - | - | - |
| Motor | Slightly hot | Inverter 65 C | ⚠️ Warning |
";
        let r = extract_categories(text);
        assert!(r.parsed);
        assert_eq!(r.categories.len(), 1);
        assert_eq!(r.categories[0].name, "Motor");
        assert_eq!(r.categories[0].metrics["Inverter"], "65 C");
    }

    #[test]
    fn all_rows_filtered_is_still_parsed() {
        let text = "| Category | Summary |\n|---|---|\n| TBD | x |\n| | y |\n";
        let r = extract_categories(text);
        assert!(r.parsed);
        assert!(r.categories.is_empty());
    }

    #[test]
    fn duplicate_category_names_keep_first() {
        let text = "| Category | Severity |\n|---|---|\n| Battery | ok |\n| **Battery** | bad |\n";
        let r = extract_categories(text);
        assert_eq!(r.categories.len(), 1);
        assert_eq!(r.categories[0].severity, "ok");
    }

    #[test]
    fn dual_table_form() {
        let r = extract_rca_capa(RCA_CAPA);
        assert!(r.parsed);
        assert_eq!(r.vehicle_id.as_deref(), Some("default"));
        assert_eq!(r.safety_criticality.as_deref(), Some("High"));

        assert_eq!(r.rca_rows.len(), 2);
        assert_eq!(r.rca_rows[0].component, "Brake System");
        assert_eq!(r.rca_rows[1].primary_cause, "Dendrite formation");
        assert_eq!(
            r.affected_components,
            Some(vec!["Brake System".to_string(), "Battery Pack".to_string()])
        );

        assert_eq!(r.capa_rows.len(), 3);
        assert_eq!(r.capa_rows[0].oem_owner, "Brake System Team");
        assert_eq!(r.oem_owners, vec!["Brake System Team", "Battery Team"]);
    }

    #[test]
    fn repeated_components_and_actions_keep_first() {
        let text = "\
## Root Cause

| Failure Component | Primary Cause |
|---|---|
| Battery Pack | Cell imbalance |
| **Battery Pack** | Thermal runaway |

## Corrective Actions

| Action Type | Action Item | OEM Owner |
|---|---|---|
| Corrective | Rebalance | Battery Team |
| Preventive | Rebalance | Quality Team |
";
        let r = extract_rca_capa(text);
        assert_eq!(r.rca_rows.len(), 1);
        assert_eq!(r.rca_rows[0].primary_cause, "Cell imbalance");
        assert_eq!(r.affected_components, Some(vec!["Battery Pack".to_string()]));
        assert_eq!(r.capa_rows.len(), 1);
        assert_eq!(r.capa_rows[0].action_type, "Corrective");
        assert_eq!(r.oem_owners, vec!["Battery Team"]);
    }

    #[test]
    fn dash_row_inside_category_table_is_skipped() {
        let text = "\
| Category | Summary | Key Values | Severity |
|---|---|---|---|
| Battery | Balanced | SOC 80% | ✅ Normal |
| - | - | - | - |
| Motor | Warm | Inverter 65 C | ⚠️ Warning |
";
        let r = extract_categories(text);
        let names: Vec<&str> = r.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Battery", "Motor"]);
    }

    #[test]
    fn unmatched_headings_are_ignored() {
        let text = "\
## Appendix

| Failure Component | Primary Cause |
|---|---|
| Motor | Bearing wear |
";
        let r = extract_rca_capa(text);
        assert!(!r.parsed);
        assert!(r.rca_rows.is_empty());
        assert_eq!(r.affected_components, None);
    }

    #[test]
    fn rca_keyword_is_matched_as_a_word() {
        assert!(heading_matches("## ROOT CAUSE ANALYSIS (RCA)", RCA_HEADING));
        assert!(!heading_matches("Figures circa 2024", RCA_HEADING));
        assert!(heading_matches("Corrective and Preventive Actions (CAPA)", CAPA_HEADING));
    }

    #[test]
    fn single_table_reply_to_rca_request_is_unparsed() {
        let record = extract(TWO_ROWS, AnalyzerKind::RcaCapa);
        assert!(!record.parsed());
        assert_eq!(record.vehicle_id(), Some("VH001"));
    }

    #[test]
    fn strip_emphasis_variants() {
        assert_eq!(strip_emphasis("  **Battery** "), "Battery");
        assert_eq!(strip_emphasis("*Electric Vehicle*"), "Electric Vehicle");
        assert_eq!(strip_emphasis("`code`"), "code");
        assert_eq!(strip_emphasis("vehicle_id"), "vehicle_id");
    }
}
