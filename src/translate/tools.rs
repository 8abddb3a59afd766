//! Tool declarations and call correlation.
//!
//! Gemini restricts function and parameter names, so a declared tool may be
//! renamed on the way out. [`ToolMapping`] remembers every rename so calls
//! coming back carry the names the client declared.
//!
//! Gemini function calls usually have no id. When one is missing the gateway
//! derives `toolu_<scope>_<ordinal>_<name>` from the response id and the call
//! position; [`decode_call_id`] reverses it so a later `tool_result` can be
//! matched to its function even when the originating `tool_use` is gone.

use super::anthropic_types::Tool;
use super::gemini_types::FunctionDeclaration;
use super::schema::{convert_schema, sanitize_function_name, unique_names, DroppedFeature, FieldRenames};
use serde_json::Value;
use tracing::warn;

pub const DERIVED_CALL_PREFIX: &str = "toolu_";

const MAX_FUNCTION_NAME_LEN: usize = 64;
const MAX_SCOPE_LEN: usize = 24;

/// Schema feature dropped while declaring a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaWarning {
    pub tool: String,
    pub feature: DroppedFeature,
}

#[derive(Debug, Clone, Default)]
pub struct ToolMapping {
    entries: Vec<ToolEntry>,
}

#[derive(Debug, Clone)]
struct ToolEntry {
    original: String,
    upstream: String,
    params: FieldRenames,
}

#[derive(Debug, Clone, Default)]
pub struct ConvertedTools {
    pub declarations: Vec<FunctionDeclaration>,
    pub mapping: ToolMapping,
    pub warnings: Vec<SchemaWarning>,
}

/// Declare client tools as Gemini functions.
pub fn convert_tools(tools: &[Tool]) -> ConvertedTools {
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    let upstream_names = unique_names(&names, sanitize_function_name, MAX_FUNCTION_NAME_LEN);

    let mut converted = ConvertedTools::default();
    for (tool, upstream) in tools.iter().zip(upstream_names) {
        let (parameters, params) = if tool.input_schema.is_null() {
            (None, FieldRenames::default())
        } else {
            let conversion = convert_schema(&tool.input_schema);
            for feature in conversion.dropped {
                warn!(
                    tool = %tool.name,
                    path = %feature.path,
                    keyword = %feature.keyword,
                    "Dropped unsupported schema feature"
                );
                converted.warnings.push(SchemaWarning {
                    tool: tool.name.clone(),
                    feature,
                });
            }
            (declared_parameters(conversion.schema), conversion.renames)
        };

        converted.declarations.push(FunctionDeclaration {
            name: upstream.clone(),
            description: tool.description.clone().filter(|d| !d.is_empty()),
            parameters,
        });
        converted.mapping.entries.push(ToolEntry {
            original: tool.name.clone(),
            upstream,
            params,
        });
    }
    converted
}

/// Gemini rejects object parameters without properties; such tools are declared bare.
fn declared_parameters(schema: Value) -> Option<Value> {
    let is_object = schema.get("type").and_then(Value::as_str) == Some("object");
    let has_properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|p| !p.is_empty());
    (is_object && has_properties).then_some(schema)
}

impl ToolMapping {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upstream name of a declared tool.
    pub fn declared(&self, original: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.original == original)
            .map(|e| e.upstream.as_str())
    }

    /// Upstream name for any tool name, declared or not.
    pub fn upstream_name(&self, original: &str) -> String {
        self.declared(original)
            .map(str::to_string)
            .unwrap_or_else(|| sanitize_function_name(original))
    }

    /// Client-facing name for a function Gemini called.
    pub fn original_name(&self, upstream: &str) -> String {
        self.entries
            .iter()
            .find(|e| e.upstream == upstream)
            .map_or_else(|| upstream.to_string(), |e| e.original.clone())
    }

    pub fn args_to_upstream(&self, original: &str, args: &Value) -> Value {
        let args = object_or_empty(args);
        match self.entries.iter().find(|e| e.original == original) {
            Some(entry) => entry.params.to_upstream(&args),
            None => args,
        }
    }

    pub fn args_from_upstream(&self, upstream: &str, args: &Value) -> Value {
        let args = object_or_empty(args);
        match self.entries.iter().find(|e| e.upstream == upstream) {
            Some(entry) => entry.params.to_original(&args),
            None => args,
        }
    }
}

fn object_or_empty(args: &Value) -> Value {
    if args.is_object() {
        args.clone()
    } else {
        Value::Object(serde_json::Map::new())
    }
}

/// Alphanumeric scope for derived call ids.
pub fn call_scope(source: &str) -> String {
    let scope: String = source
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_SCOPE_LEN)
        .collect();
    if scope.is_empty() {
        "0".to_string()
    } else {
        scope
    }
}

pub fn derive_call_id(scope: &str, ordinal: usize, name: &str) -> String {
    format!("{DERIVED_CALL_PREFIX}{scope}_{ordinal}_{name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedCallId {
    pub scope: String,
    pub ordinal: usize,
    pub name: String,
}

/// Decode an id made by [`derive_call_id`]. Ids minted elsewhere give `None`.
pub fn decode_call_id(id: &str) -> Option<DerivedCallId> {
    let rest = id.strip_prefix(DERIVED_CALL_PREFIX)?;
    let mut fields = rest.splitn(3, '_');
    let scope = fields.next()?;
    let ordinal = fields.next()?.parse().ok()?;
    let name = fields.next()?;
    if scope.is_empty() || name.is_empty() || !scope.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(DerivedCallId {
        scope: scope.to_string(),
        ordinal,
        name: name.to_string(),
    })
}
