//! OCR collaborator abstraction.
//!
//! Defines the [`DocumentOcr`] trait, the typed block graph the collaborator
//! returns, and the pure assembly pass that flattens blocks into lines,
//! row-major tables, and key/value pairs. Untyped JSON never crosses this
//! boundary.

pub mod http;

use crate::error::UpstreamError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One recognized block from the collaborator's block graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "block_type", rename_all = "snake_case")]
pub enum Block {
    /// A recognized line of text, in scan order.
    Line { text: String },
    /// A table cell addressed by table, row, and column.
    Cell {
        table_id: String,
        row_index: usize,
        column_index: usize,
        text: String,
    },
    /// A form field half: keys reference their values through `value_ids`.
    KeyValue {
        id: String,
        role: KeyValueRole,
        text: String,
        #[serde(default)]
        value_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValueRole {
    Key,
    Value,
}

/// Raw outcome of one collaborator call: the parsed blocks plus the verbatim
/// payload, which is surfaced only when debug mode asks for it.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub blocks: Vec<Block>,
    pub raw: serde_json::Value,
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait DocumentOcr: Send + Sync {
    fn name(&self) -> &str;
    async fn analyze(&self, bytes: &[u8], mime_type: &str) -> Result<OcrOutcome, UpstreamError>;
}

// ============================================================================
// Assembly
// ============================================================================

/// Flattened extraction result handed to the analysis stage and returned to
/// API callers. `raw_text` is always the newline-join of `lines`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedText {
    pub raw_text: String,
    pub lines: Vec<String>,
    pub tables: Vec<Vec<Vec<String>>>,
    pub key_value_pairs: Vec<KeyValuePair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Single-pass assembly of a block list: lines keep scan order, cells are
/// regrouped into row-major grids (tables ordered by first appearance), and
/// key blocks are paired with the value blocks they reference.
pub fn assemble(blocks: &[Block]) -> ExtractedText {
    let mut lines = Vec::new();
    let mut table_order: Vec<&str> = Vec::new();
    let mut grids: HashMap<&str, Vec<(usize, usize, &str)>> = HashMap::new();
    let mut value_texts: HashMap<&str, &str> = HashMap::new();
    let mut keys: Vec<(&str, &Vec<String>)> = Vec::new();

    for block in blocks {
        match block {
            Block::Line { text } => lines.push(text.clone()),
            Block::Cell {
                table_id,
                row_index,
                column_index,
                text,
            } => {
                if !grids.contains_key(table_id.as_str()) {
                    table_order.push(table_id.as_str());
                }
                grids
                    .entry(table_id.as_str())
                    .or_default()
                    .push((*row_index, *column_index, text.as_str()));
            }
            Block::KeyValue {
                id,
                role,
                text,
                value_ids,
            } => match role {
                KeyValueRole::Value => {
                    value_texts.insert(id.as_str(), text.as_str());
                }
                KeyValueRole::Key => keys.push((text.as_str(), value_ids)),
            },
        }
    }

    let tables = table_order
        .iter()
        .map(|id| build_grid(&grids[id]))
        .collect();

    let key_value_pairs = keys
        .into_iter()
        .filter_map(|(key, value_ids)| {
            let resolved: Vec<&str> = value_ids
                .iter()
                .filter_map(|vid| value_texts.get(vid.as_str()).copied())
                .collect();
            if resolved.is_empty() {
                None
            } else {
                Some(KeyValuePair {
                    key: key.to_string(),
                    value: resolved.join(" "),
                })
            }
        })
        .collect();

    ExtractedText {
        raw_text: lines.join("\n"),
        lines,
        tables,
        key_value_pairs,
    }
}

/// Turn sparse (row, col, text) cells into a dense row-major grid. Rows and
/// columns are sorted by index; gaps become empty strings.
fn build_grid(cells: &[(usize, usize, &str)]) -> Vec<Vec<String>> {
    let max_row = cells.iter().map(|(r, _, _)| *r).max().unwrap_or(0);
    let max_col = cells.iter().map(|(_, c, _)| *c).max().unwrap_or(0);

    let mut grid = vec![vec![String::new(); max_col + 1]; max_row + 1];
    for (row, col, text) in cells {
        grid[*row][*col] = (*text).to_string();
    }
    grid
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(test)]
pub struct StubOcr {
    pub blocks: Vec<Block>,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StubOcr {
    pub fn returning(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl DocumentOcr for StubOcr {
    fn name(&self) -> &str {
        "stub"
    }

    async fn analyze(&self, _bytes: &[u8], _mime_type: &str) -> Result<OcrOutcome, UpstreamError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(OcrOutcome {
            blocks: self.blocks.clone(),
            raw: serde_json::json!({"stub": true}),
        })
    }
}
