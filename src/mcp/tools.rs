//! Queries exposed as MCP tools.

use crate::connector::rows_to_json;
use crate::executor::validate::coerce_default;
use crate::executor::Executor;
use crate::model::{Model, Query};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// One entry of a `tools/list` result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn from_query(query: &Query) -> Self {
        Self {
            name: query.name.clone(),
            description: query.description.clone(),
            input_schema: input_schema(query),
        }
    }
}

/// Every query of the model, in declaration order.
pub fn list_tools(model: &Model) -> Vec<ToolDescriptor> {
    model.queries.iter().map(ToolDescriptor::from_query).collect()
}

/// JSON schema of a query's inputs.
///
/// Defaults are emitted with their declared type, so an `int` default of
/// `"5"` appears as the number `5`. Inputs that are optional or carry a
/// default are not listed as required.
pub fn input_schema(query: &Query) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for input in &query.inputs {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(input.input_type.json_schema_type()));
        if let Some(format) = input.input_type.json_schema_format() {
            prop.insert("format".into(), json!(format));
        }
        if !input.description.is_empty() {
            prop.insert("description".into(), json!(input.description));
        }
        if let Some(default) = &input.default {
            if let Ok(value) = coerce_default(input, default) {
                prop.insert("default".into(), value.to_json());
            }
        }
        properties.insert(input.name.clone(), Value::Object(prop));

        if input.is_required() && input.default.is_none() {
            required.push(json!(input.name));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Re-encode each argument as JSON text for the executor boundary.
pub fn encode_arguments(arguments: &Map<String, Value>) -> HashMap<String, String> {
    arguments
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

/// Outcome of a tool invocation.
///
/// Execution failures are reported here with `is_error` set rather than as
/// protocol errors, so the client sees them as tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn to_json(&self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.text }],
            "isError": self.is_error,
        })
    }
}

/// Run a query as a tool call.
pub async fn call_tool(
    executor: &Executor,
    cancel: &CancellationToken,
    name: &str,
    arguments: &HashMap<String, String>,
) -> ToolOutput {
    match executor.execute(cancel, name, arguments).await {
        Ok(rows) => ToolOutput {
            text: rows_to_json(&rows),
            is_error: false,
        },
        Err(e) => ToolOutput {
            text: e.to_string(),
            is_error: true,
        },
    }
}
