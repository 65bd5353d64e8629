//! Semantic map: tables as nodes, inferred join relationships as edges
//!
//! The model proposes the graph; [`SemanticMapper`] validates it against the
//! profiled tables before anything downstream can see it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::llm::{extract_json, LlmCaller, LlmError, LlmRequest, Purpose};
use crate::profile::{render_summary, TableProfile};

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Semantic mapping call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Semantic map response could not be parsed: {0}")]
    Unparseable(String),

    #[error("No tables to map")]
    EmptyDataset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticNode {
    pub table: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnEndpoint {
    pub table: String,
    pub column: String,
}

impl ColumnEndpoint {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticEdge {
    pub from: ColumnEndpoint,
    pub to: ColumnEndpoint,
    /// Relationship tag such as `JOIN` or `LOOKUP`
    pub kind: String,
    /// Advisory only, always within [0, 1]
    pub confidence: f64,
}

impl SemanticEdge {
    fn connects(&self, tables: &HashSet<&str>) -> bool {
        tables.contains(self.from.table.as_str()) && tables.contains(self.to.table.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticMap {
    pub nodes: Vec<SemanticNode>,
    pub edges: Vec<SemanticEdge>,
    /// What validation dropped or added
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl SemanticMap {
    pub fn node(&self, table: &str) -> Option<&SemanticNode> {
        self.nodes.iter().find(|n| n.table == table)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes.iter().map(|n| n.table.as_str())
    }

    /// Nodes named in `tables` plus only the edges between them
    pub fn subgraph<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> SemanticMap {
        let wanted: HashSet<&str> = tables.into_iter().collect();
        let nodes: Vec<SemanticNode> = self
            .nodes
            .iter()
            .filter(|n| wanted.contains(n.table.as_str()))
            .cloned()
            .collect();
        let kept: HashSet<&str> = nodes.iter().map(|n| n.table.as_str()).collect();
        let edges = self
            .edges
            .iter()
            .filter(|e| e.connects(&kept))
            .cloned()
            .collect();

        SemanticMap {
            nodes,
            edges,
            diagnostics: Vec::new(),
        }
    }

    /// Text rendering for prompts
    pub fn render(&self) -> String {
        let mut out = String::from("Tables:\n");
        for node in &self.nodes {
            if node.description.is_empty() {
                out.push_str(&format!("- {}\n", node.table));
            } else {
                out.push_str(&format!("- {}: {}\n", node.table, node.description));
            }
        }
        if self.edges.is_empty() {
            out.push_str("Relationships: none\n");
        } else {
            out.push_str("Relationships:\n");
            for edge in &self.edges {
                out.push_str(&format!(
                    "- {} -> {} ({}, confidence {:.2})\n",
                    edge.from, edge.to, edge.kind, edge.confidence
                ));
            }
        }
        out
    }
}

const SYSTEM_PROMPT: &str = r#"You are a data relationship analyst. Given profiles of several spreadsheet tables (column names, types, sample values, statistics):

1. Describe what each table holds in one short sentence.
2. Infer the columns that relate tables to each other (join keys).

Rules:
- Only propose relationships supported by column names, matching types and overlapping sample values. Do not invent any.
- Use the exact table and column names from the profiles, written as "Table.column".
- confidence is between 0 and 1."#;

const RESPONSE_SCHEMA: &str = r#"{
  "nodes": [{"table": "<table>", "description": "<what the table holds>"}],
  "edges": [{"from_col": "<table>.<column>", "to_col": "<table>.<column>", "logic": "JOIN", "confidence": 0.9}]
}"#;

/// Shape the model answers with
#[derive(Debug, Deserialize)]
struct RawMap {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<RawEdge>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    table: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    #[serde(alias = "from")]
    from_col: String,
    #[serde(alias = "to")]
    to_col: String,
    #[serde(default, alias = "kind")]
    logic: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct SemanticMapper {
    caller: LlmCaller,
}

impl SemanticMapper {
    pub fn new(caller: LlmCaller) -> Self {
        Self { caller }
    }

    /// Ask the model for a map and validate it against `profiles`.
    ///
    /// An unparseable reply gets exactly one reformatting retry.
    pub async fn build(&self, profiles: &[TableProfile]) -> Result<SemanticMap, MappingError> {
        if profiles.is_empty() {
            return Err(MappingError::EmptyDataset);
        }

        let mut request = LlmRequest::new(
            Purpose::SemanticMap,
            SYSTEM_PROMPT,
            format!(
                "Analyze these tables and infer how they relate:\n\n{}",
                render_summary(profiles)
            ),
        )
        .with_schema(RESPONSE_SCHEMA);

        let reply = self.caller.call(&request).await?;
        let raw = match parse_raw(&reply) {
            Ok(raw) => raw,
            Err(first) => {
                tracing::warn!(error = %first, "Semantic map reply unparseable, asking to reformat");
                request.follow_up(
                    reply,
                    format!(
                        "That reply could not be parsed ({}). Reply with only the JSON object in this shape:\n{}",
                        first, RESPONSE_SCHEMA
                    ),
                );
                let retry = self.caller.call(&request).await?;
                parse_raw(&retry).map_err(MappingError::Unparseable)?
            }
        };

        let map = validate(raw, profiles);
        tracing::info!(
            nodes = map.nodes.len(),
            edges = map.edges.len(),
            dropped = map.diagnostics.len(),
            "Semantic map built"
        );
        Ok(map)
    }
}

fn parse_raw(reply: &str) -> Result<RawMap, String> {
    serde_json::from_str(extract_json(reply)).map_err(|e| e.to_string())
}

/// Canonical table name, matching exactly first and then case-insensitively
fn canonical_table<'a>(profiles: &'a [TableProfile], name: &str) -> Option<&'a TableProfile> {
    let name = name.trim();
    profiles
        .iter()
        .find(|p| p.table == name)
        .or_else(|| profiles.iter().find(|p| p.table.eq_ignore_ascii_case(name)))
}

/// Resolve `Table.column`; table names may themselves contain dots
fn resolve_endpoint(profiles: &[TableProfile], raw: &str) -> Option<ColumnEndpoint> {
    raw.match_indices('.').find_map(|(dot, _)| {
        let table = canonical_table(profiles, &raw[..dot])?;
        let wanted = raw[dot + 1..].trim();
        let column = table
            .column_names()
            .find(|c| *c == wanted)
            .or_else(|| table.column_names().find(|c| c.eq_ignore_ascii_case(wanted)))?;
        Some(ColumnEndpoint::new(table.table.clone(), column))
    })
}

fn validate(raw: RawMap, profiles: &[TableProfile]) -> SemanticMap {
    let mut diagnostics = Vec::new();

    let mut described: Vec<(String, String)> = Vec::new();
    for node in raw.nodes {
        match canonical_table(profiles, &node.table) {
            Some(profile) if !described.iter().any(|(t, _)| *t == profile.table) => {
                described.push((profile.table.clone(), node.description.trim().to_string()));
            }
            Some(_) => {}
            None => diagnostics.push(format!("dropped node for unknown table '{}'", node.table)),
        }
    }

    // One node per profiled table, in profile order
    let nodes = profiles
        .iter()
        .map(|profile| {
            let description = described
                .iter()
                .find(|(t, _)| *t == profile.table)
                .map(|(_, d)| d.clone());
            if description.is_none() {
                diagnostics.push(format!("table '{}' had no node; added", profile.table));
            }
            SemanticNode {
                table: profile.table.clone(),
                description: description.unwrap_or_default(),
            }
        })
        .collect();

    let mut edges: Vec<SemanticEdge> = Vec::new();
    for edge in raw.edges {
        let (Some(from), Some(to)) = (
            resolve_endpoint(profiles, &edge.from_col),
            resolve_endpoint(profiles, &edge.to_col),
        ) else {
            diagnostics.push(format!(
                "dropped edge {} -> {}: unknown table or column",
                edge.from_col, edge.to_col
            ));
            continue;
        };

        if from.table == to.table {
            diagnostics.push(format!("dropped self-referencing edge {} -> {}", from, to));
            continue;
        }
        if edges
            .iter()
            .any(|e| (e.from == from && e.to == to) || (e.from == to && e.to == from))
        {
            diagnostics.push(format!("dropped duplicate edge {} -> {}", from, to));
            continue;
        }

        let confidence = match edge.confidence {
            Some(c) if c.is_nan() => 0.0,
            Some(c) => c.clamp(0.0, 1.0),
            None => 0.5,
        };
        let kind = edge
            .logic
            .map(|k| k.trim().to_ascii_uppercase())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "JOIN".to_string());

        edges.push(SemanticEdge {
            from,
            to,
            kind,
            confidence,
        });
    }

    for diagnostic in &diagnostics {
        tracing::warn!(diagnostic = %diagnostic, "Semantic map validation");
    }

    SemanticMap {
        nodes,
        edges,
        diagnostics,
    }
}
