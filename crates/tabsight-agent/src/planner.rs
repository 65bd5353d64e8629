//! Natural-language transformation plans

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{extract_json, LlmCaller, LlmError, LlmRequest, Purpose};
use crate::profile::{render_summary, TableProfile};
use crate::router::Intent;
use crate::semantic::SemanticMap;

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("Planning call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Planner returned no steps")]
    Empty,
}

/// Ordered imperative steps; not executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
}

impl Plan {
    pub fn new(steps: Vec<String>) -> Self {
        Self { steps }
    }

    /// Whether any step joins, merges or looks up another table
    pub fn has_join_step(&self) -> bool {
        self.steps.iter().any(|step| {
            let lowered = step.to_lowercase();
            let words: Vec<&str> = lowered
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect();
            words
                .iter()
                .any(|w| w.starts_with("join") || w.starts_with("merg") || *w == "lookup")
                || words.windows(2).any(|pair| pair == ["look", "up"])
        })
    }

    /// Whether the plan asks to keep only rows present on both sides
    pub fn wants_intersection(&self) -> bool {
        self.steps.iter().any(|step| {
            let lowered = step.to_lowercase();
            lowered.contains("inner join")
                || lowered.contains("intersection")
                || lowered.contains("only matching")
        })
    }

    pub fn render(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Everything one planning call needs
pub struct PlanInput<'a> {
    pub query: &'a str,
    pub intent: Intent,
    pub subgraph: &'a SemanticMap,
    /// Profiles of the subgraph's tables only
    pub profiles: &'a [TableProfile],
    /// Failure diagnostic of the previous attempt
    pub hint: Option<&'a str>,
    pub attempt: u32,
}

const SYSTEM_PROMPT: &str = r#"You are a data analysis planner. Turn the user's question into a short ordered list of imperative steps over the listed tables.

Rules:
- Reference only the tables and columns listed under "Available identifiers", spelled exactly as listed.
- Use as few tables as possible. Only join when the question needs data from more than one table, and name the join keys explicitly (A.col = B.col).
- Prefer a left join that keeps every row of the primary table unless the question asks only for matching rows.
- End with the step that produces the final answer."#;

const RESPONSE_SCHEMA: &str = r#"{"steps": ["<step 1>", "<step 2>"]}"#;

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default, alias = "plan")]
    steps: Vec<String>,
}

pub fn render_identifiers(profiles: &[TableProfile]) -> String {
    profiles
        .iter()
        .map(|profile| {
            let columns: Vec<&str> = profile.column_names().collect();
            format!("- {}: {}", profile.table, columns.join(", "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Planner {
    caller: LlmCaller,
    thinking: bool,
}

impl Planner {
    pub fn new(caller: LlmCaller, thinking: bool) -> Self {
        Self { caller, thinking }
    }

    pub async fn plan(&self, input: &PlanInput<'_>) -> Result<Plan, PlanningError> {
        let mut prompt = format!(
            "Question: {}\nAnalysis type: {}\n\nAvailable identifiers:\n{}\n\n{}\nData profile:\n{}",
            input.query,
            input.intent,
            render_identifiers(input.profiles),
            input.subgraph.render(),
            render_summary(input.profiles),
        );
        if let Some(hint) = input.hint {
            prompt.push_str(&format!(
                "\nThe previous attempt failed:\n{}\nMake a plan that avoids this failure, for example with different join keys, a different join type or different columns.\n",
                hint
            ));
        }

        let request = LlmRequest::new(Purpose::Planning, SYSTEM_PROMPT, prompt)
            .with_schema(RESPONSE_SCHEMA)
            .with_thinking(self.thinking);
        let reply = self.caller.call(&request).await?;

        let plan = parse_plan(&reply);
        if plan.steps.is_empty() {
            return Err(PlanningError::Empty);
        }

        tracing::info!(attempt = input.attempt, steps = plan.steps.len(), "Plan ready");
        tracing::debug!(plan = %plan.render(), "Plan steps");
        Ok(plan)
    }
}

/// JSON `{"steps": [...]}` or, failing that, a numbered list
fn parse_plan(reply: &str) -> Plan {
    if let Ok(raw) = serde_json::from_str::<RawPlan>(extract_json(reply)) {
        return Plan::new(
            raw.steps
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        );
    }

    let steps = reply
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*'])
                .trim()
        })
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("plan:") && !line.starts_with("```"))
        .map(str::to_string)
        .collect();
    Plan::new(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_plan() {
        let plan = parse_plan(r#"{"steps": ["Filter Orders", "  ", "Sum Orders.Amount"]}"#);
        assert_eq!(plan.steps, vec!["Filter Orders", "Sum Orders.Amount"]);
        assert!(!plan.has_join_step());
    }

    #[test]
    fn test_parse_numbered_plan() {
        let plan = parse_plan(
            "Plan:\n1. Left join Orders with Customers on Orders.customer_id = Customers.customer_id\n2) Group by region\n- Sum Amount",
        );

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[1], "Group by region");
        assert!(plan.has_join_step());
        assert!(!plan.wants_intersection());
        assert!(plan.render().starts_with("1. Left join Orders"));
    }

    #[test]
    fn test_join_step_keywords() {
        let joins = |step: &str| Plan::new(vec![step.to_string()]).has_join_step();

        assert!(joins("Merge Orders with Customers on customer_id"));
        assert!(joins("Look up each order's region in Customers"));
        assert!(joins("Joining the lookup table"));
        assert!(!joins("Filter rows matching status = 'paid'"));
        assert!(!joins("Combine the monthly totals into one figure"));
        assert!(!joins("Count rows where the name matches 'A%'"));
    }

    #[test]
    fn test_render_identifiers() {
        let profiles = vec![TableProfile {
            table: "Orders".to_string(),
            row_count: 0,
            columns: vec![],
        }];
        assert_eq!(render_identifiers(&profiles), "- Orders: ");
    }
}
