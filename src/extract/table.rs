use std::collections::HashMap;

use super::strip_emphasis;

const DELIMITER: char = '|';

/// A pipe-delimited table found in free text
#[derive(Debug, Clone, PartialEq)]
pub struct TableBlock {
    /// Nearest non-blank, non-table line above the header
    pub heading: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableBlock {
    /// Index of the first column whose normalized name matches one of `names`
    pub fn column(&self, names: &[&str]) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| names.iter().any(|n| normalize_header(h) == *n))
    }

    pub fn has_column(&self, names: &[&str]) -> bool {
        self.column(names).is_some()
    }

    /// Rows as normalized-header → cleaned value maps
    pub fn records(&self) -> Vec<Row> {
        self.rows
            .iter()
            .map(|cells| Row {
                cells: self
                    .headers
                    .iter()
                    .map(|h| normalize_header(h))
                    .zip(cells.iter().map(|c| strip_emphasis(c)))
                    .collect(),
            })
            .collect()
    }
}

/// One decoded data line
#[derive(Debug, Clone, Default)]
pub struct Row {
    cells: HashMap<String, String>,
}

impl Row {
    /// First present column among `names`, or an empty string
    pub fn get(&self, names: &[&str]) -> String {
        names
            .iter()
            .find_map(|n| self.cells.get(*n))
            .cloned()
            .unwrap_or_default()
    }
}

/// Lowercased, emphasis-free, single-spaced header name
pub fn normalize_header(h: &str) -> String {
    strip_emphasis(h)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Split a table line into trimmed cells, ignoring one outer pipe on each side.
pub fn split_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix(DELIMITER).unwrap_or(trimmed);
    let inner = inner.strip_suffix(DELIMITER).unwrap_or(inner);
    inner.split(DELIMITER).map(|c| c.trim().to_string()).collect()
}

/// A delimiter line whose every cell is `:?-{3,}:?`
fn is_separator(line: &str) -> bool {
    line.contains(DELIMITER) && split_row(line).iter().all(|c| is_rule_cell(c))
}

fn is_rule_cell(cell: &str) -> bool {
    let inner = cell.strip_prefix(':').unwrap_or(cell);
    let inner = inner.strip_suffix(':').unwrap_or(inner);
    inner.len() >= 3 && inner.chars().all(|c| c == '-')
}

fn is_header(line: &str) -> bool {
    line.contains(DELIMITER) && !is_separator(line) && split_row(line).iter().any(|c| !c.is_empty())
}

fn heading_above(lines: &[&str], header_idx: usize) -> Option<String> {
    let line = lines[..header_idx]
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())?;
    if line.contains(DELIMITER) {
        return None;
    }
    let text = strip_emphasis(line.trim().trim_start_matches('#'));
    (!text.is_empty()).then_some(text)
}

/// Find every header + separator block and its data lines.
///
/// Data lines are the consecutive delimiter-bearing lines after the
/// separator; lines whose cell count differs from the header are skipped.
/// A new block can only start after a line without a delimiter.
pub fn find_tables(text: &str) -> Vec<TableBlock> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i + 1 < lines.len() {
        if !(is_header(lines[i]) && is_separator(lines[i + 1])) {
            i += 1;
            continue;
        }

        let headers = split_row(lines[i]);
        let heading = heading_above(&lines, i);
        let mut rows = Vec::new();
        let mut j = i + 2;

        while j < lines.len() && lines[j].contains(DELIMITER) {
            if is_separator(lines[j]) {
                j += 1;
                continue;
            }
            let cells = split_row(lines[j]);
            if cells.len() == headers.len() {
                rows.push(cells);
            } else {
                tracing::debug!(
                    expected = headers.len(),
                    found = cells.len(),
                    "Skipping table row with mismatched column count"
                );
            }
            j += 1;
        }

        blocks.push(TableBlock { heading, headers, rows });
        i = j;
    }

    blocks
}
