//! Intent classification and subgraph selection

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::llm::{extract_json, LlmCaller, LlmRequest, Purpose};
use crate::semantic::SemanticMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    /// Statistics and aggregates
    Descriptive,
    /// Causes and comparisons
    Diagnostic,
    /// Questions spanning several tables
    Relational,
}

impl Intent {
    fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.starts_with("descript") {
            Some(Intent::Descriptive)
        } else if lowered.starts_with("diagnos") {
            Some(Intent::Diagnostic)
        } else if lowered.starts_with("relation") {
            Some(Intent::Relational)
        } else {
            None
        }
    }

    /// Keyword guess used when the model gives no usable category
    fn infer(query: &str, selected_tables: usize) -> Self {
        let lowered = query.to_lowercase();
        let diagnostic = ["why", "cause", "compare", "difference", "versus", " vs "];
        if diagnostic.iter().any(|word| lowered.contains(word)) {
            Intent::Diagnostic
        } else if selected_tables > 1 {
            Intent::Relational
        } else {
            Intent::Descriptive
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::Descriptive => "Descriptive",
            Intent::Diagnostic => "Diagnostic",
            Intent::Relational => "Relational",
        };
        f.write_str(name)
    }
}

/// How the subgraph was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Model,
    Lexical,
    FullGraph,
}

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub intent: Intent,
    pub subgraph: SemanticMap,
    pub selection: Selection,
}

const SYSTEM_PROMPT: &str = r#"You classify business analysis questions about spreadsheet tables.

Decide:
1. The analysis type: "Descriptive" (statistics, totals, summaries), "Diagnostic" (causes, comparisons) or "Relational" (requires combining tables).
2. The smallest set of tables needed to answer the question. Use the exact table names listed. Do not include tables the question does not need."#;

const RESPONSE_SCHEMA: &str = r#"{"intent": "Descriptive | Diagnostic | Relational", "tables": ["<table>"], "description": "<one sentence>"}"#;

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(default, alias = "analysis_type")]
    intent: Option<String>,
    #[serde(default, alias = "mentioned_tables")]
    tables: Vec<String>,
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "what", "which", "who", "how", "many", "much", "per",
    "each", "all", "are", "was", "were", "its", "their", "table", "tables", "column", "columns",
    "sum", "total", "count", "average", "show", "list", "give", "find", "top", "into", "over",
];

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

pub struct IntentRouter {
    caller: LlmCaller,
}

impl IntentRouter {
    pub fn new(caller: LlmCaller) -> Self {
        Self { caller }
    }

    /// Classify `query` and prune `map` to the tables it needs.
    ///
    /// Never fails: a failed or unusable model reply counts as zero tables
    /// selected and falls back to lexical matching, then to the full graph.
    pub async fn route(&self, query: &str, map: &SemanticMap, summary: &str) -> Route {
        let request = LlmRequest::new(
            Purpose::Routing,
            SYSTEM_PROMPT,
            format!(
                "Data overview:\n{}\n{}\nQuestion: {}",
                summary,
                map.render(),
                query
            ),
        )
        .with_schema(RESPONSE_SCHEMA);

        let raw = match self.caller.call(&request).await {
            Ok(reply) => match serde_json::from_str::<RawRoute>(extract_json(&reply)) {
                Ok(raw) => Some(raw),
                Err(err) => {
                    tracing::warn!(error = %err, "Routing reply unparseable");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "Routing call failed");
                None
            }
        };

        let (model_intent, requested) = match raw {
            Some(raw) => (raw.intent.as_deref().and_then(Intent::parse), raw.tables),
            None => (None, Vec::new()),
        };

        let mut selection = Selection::Model;
        let mut selected = select_known(map, &requested);

        if selected.is_empty() {
            selection = Selection::Lexical;
            selected = lexical_matches(map, query);
            tracing::warn!(tables = ?selected, "Model selected no tables, using lexical match");
        }
        if selected.is_empty() {
            selection = Selection::FullGraph;
            selected = map.table_names().map(str::to_string).collect();
            tracing::warn!("No lexical match, routing over the full graph");
        }

        let subgraph = map.subgraph(selected.iter().map(String::as_str));
        let intent = model_intent.unwrap_or_else(|| Intent::infer(query, subgraph.nodes.len()));

        tracing::info!(
            intent = %intent,
            selection = ?selection,
            tables = subgraph.nodes.len(),
            edges = subgraph.edges.len(),
            "Query routed"
        );

        Route {
            intent,
            subgraph,
            selection,
        }
    }
}

/// Requested names that exist in the map, canonicalized and deduplicated
fn select_known(map: &SemanticMap, requested: &[String]) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for name in requested {
        let name = name.trim();
        let found = map
            .table_names()
            .find(|t| *t == name)
            .or_else(|| map.table_names().find(|t| t.eq_ignore_ascii_case(name)));
        match found {
            Some(table) if !selected.iter().any(|s| s == table) => selected.push(table.to_string()),
            Some(_) => {}
            None => tracing::debug!(table = %name, "Routing named an unknown table"),
        }
    }
    selected
}

/// Tables whose name or description shares a term with the query
fn lexical_matches(map: &SemanticMap, query: &str) -> Vec<String> {
    let query_terms = terms(query);
    map.nodes
        .iter()
        .filter(|node| {
            let name = node.table.to_lowercase();
            let name_terms = terms(&node.table);
            let description_terms = terms(&node.description);
            query_terms.iter().any(|term| {
                name.contains(term.as_str())
                    || name_terms.contains(term)
                    || description_terms.contains(term)
            })
        })
        .map(|node| node.table.clone())
        .collect()
}
