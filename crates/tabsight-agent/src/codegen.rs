//! Plan to executable program
//!
//! The generated code is a JSON program in the tabsight IR. It reads tables
//! from the store by exact name and its main pipeline is bound to
//! [`tabsight_ir::OUTPUT_NAME`].

use serde::Serialize;
use tabsight_ir::{JoinType, Program};

use crate::llm::{extract_json, LlmCaller, LlmError, LlmRequest, Purpose};
use crate::planner::{render_identifiers, Plan};
use crate::profile::TableProfile;
use crate::semantic::SemanticMap;

/// Generated code of one attempt
#[derive(Debug, Clone, Serialize)]
pub struct CodeArtifact {
    pub attempt: u32,
    pub code: String,
    pub plan: Plan,
}

const SYSTEM_PROMPT: &str = r#"You translate a data transformation plan into a tabsight program, a JSON document executed against in-memory tables.

Program format:
```json
{
  "lets": [
    {"name": "big_orders", "pipeline": { ... }}
  ],
  "pipeline": {
    "source": {"type": "Table", "name": "Orders", "alias": "o"},
    "ops": [ ... ]
  }
}
```
"lets" is optional. Each let binds a pipeline to a name later pipelines can read as a table. The main "pipeline" produces the final answer, which is stored as "result".

Sources:
- {"type": "Table", "name": "<exact table name>", "alias": "<optional>"}
- {"type": "SubPipeline", "pipeline": { ... }, "alias": "<name>"}

Expressions:
- {"type": "Column", "col": {"table": "<qualifier, optional>", "column": "<exact column name>"}}
- {"type": "Literal", "value": 42}
- {"type": "BinaryOp", "op": "Eq", "left": <expr>, "right": <expr>}
  op is one of Add, Sub, Mul, Div, Mod, Eq, Ne, Lt, Le, Gt, Ge, And, Or, Like, ILike
- {"type": "UnaryOp", "op": "Not", "expr": <expr>}   (Neg or Not)
- {"type": "FuncCall", "func": "lower", "args": [<expr>]}
  functions: lower, upper, length, abs, round, coalesce, is_null, concat
- {"type": "InSet", "expr": <expr>, "set": [<expr>, ...]}

Operators (the "op" field):
- {"op": "Filter", "condition": <expr>}
- {"op": "Select", "projections": [<expr> or {"expr": <expr>, "alias": "name"}]}
  Computed projections need an alias. The alias sits next to "expr"; there is no "type": "Aliased".
- {"op": "Map", "mappings": {"new_column": <expr>}}
- {"op": "Join", "source": <source>, "on": <expr>, "join_type": "Left"}
  join_type is one of Inner, Left, Right, Full, Semi, Anti, Cross. Cross takes no "on".
- {"op": "GroupBy", "keys": [{"column": "region"}], "aggs": {"revenue": {"func": "sum", "args": [<expr>]}}}
  aggregates: count (no args counts rows), count_distinct, sum, avg, min, max
- {"op": "Sort", "keys": [{"expr": <expr>, "desc": true}]}
- {"op": "Take", "limit": 10}
- {"op": "Distinct"}

Rules:
- Use table and column names exactly as listed, including case.
- Qualify columns with the table name or alias whenever more than one table is in scope.
- Always state join_type. Use "Left" unless the plan asks only for matching rows.
- Join only on the key columns named in the plan or the relationships.
- Return only the JSON program."#;

/// Everything one generation call needs
pub struct CodeInput<'a> {
    pub query: &'a str,
    pub plan: &'a Plan,
    pub subgraph: &'a SemanticMap,
    pub profiles: &'a [TableProfile],
    pub hint: Option<&'a str>,
    pub attempt: u32,
}

pub struct CodeGenerator {
    caller: LlmCaller,
    thinking: bool,
}

impl CodeGenerator {
    pub fn new(caller: LlmCaller, thinking: bool) -> Self {
        Self { caller, thinking }
    }

    pub async fn generate(&self, input: &CodeInput<'_>) -> Result<CodeArtifact, LlmError> {
        let mut prompt = format!(
            "Question: {}\n\nPlan:\n{}\n\nAvailable identifiers:\n{}\n\n{}",
            input.query,
            input.plan.render(),
            render_identifiers(input.profiles),
            input.subgraph.render(),
        );
        if let Some(hint) = input.hint {
            prompt.push_str(&format!("\nThe previous program failed:\n{}\n", hint));
        }

        let request = LlmRequest::new(Purpose::CodeGeneration, SYSTEM_PROMPT, prompt)
            .with_thinking(self.thinking);
        let reply = self.caller.call(&request).await?;
        let code = normalize(&reply, input.plan);

        tracing::info!(attempt = input.attempt, chars = code.len(), "Code generated");
        tracing::debug!(code = %code, "Generated program");

        Ok(CodeArtifact {
            attempt: input.attempt,
            code,
            plan: input.plan.clone(),
        })
    }
}

/// Canonicalize a model reply and fill in unspecified join types.
///
/// Joins without a type become left joins, or inner joins when the plan asks
/// for matching rows only. A reply that does not parse is kept as-is so the
/// executor reports it.
pub fn normalize(reply: &str, plan: &Plan) -> String {
    let payload = extract_json(reply);
    let mut program = match Program::from_json(payload) {
        Ok(program) => program,
        Err(err) => {
            tracing::debug!(error = %err, "Generated code is not a valid program");
            return payload.to_string();
        }
    };

    let default = if plan.wants_intersection() {
        JoinType::Inner
    } else {
        JoinType::Left
    };
    program.for_each_join_type_mut(&mut |join_type| {
        if join_type.is_none() {
            *join_type = Some(default);
        }
    });
    tracing::debug!(
        fingerprint = %program.fingerprint(),
        joins = program.join_count(),
        "Normalized generated program"
    );
    program.to_json_pretty()
}
