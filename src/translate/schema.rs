//! JSON Schema → Gemini function-parameter schema.
//!
//! Gemini accepts a small OpenAPI-flavoured subset of JSON Schema. Conversion
//! never fails: anything outside the subset is rewritten into an equivalent
//! supported form when one exists and stripped otherwise. Every strip is
//! reported in [`SchemaConversion::dropped`]. Converting an already converted
//! schema returns it unchanged.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

const MAX_DEPTH: usize = 24;

const SUPPORTED_TYPES: &[&str] = &["string", "number", "integer", "boolean", "array", "object"];

/// Keywords the converter understands. Anything else is dropped.
const HANDLED_KEYWORDS: &[&str] = &[
    "type",
    "format",
    "description",
    "title",
    "nullable",
    "enum",
    "const",
    "properties",
    "required",
    "items",
    "minItems",
    "maxItems",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "pattern",
    "$defs",
    "definitions",
];

/// A schema feature that could not be carried over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedFeature {
    /// JSON-pointer-like location in the source schema, `#` is the root.
    pub path: String,
    pub keyword: String,
    pub detail: Option<String>,
}

impl fmt::Display for DroppedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.keyword)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaConversion {
    pub schema: Value,
    pub dropped: Vec<DroppedFeature>,
    pub renames: FieldRenames,
}

/// Property renames applied during conversion, as a tree mirroring the schema.
///
/// Used to rename call arguments on the way to Gemini and to restore the
/// original names on arguments coming back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldRenames {
    properties: BTreeMap<String, RenamedField>,
    items: Option<Box<FieldRenames>>,
}

#[derive(Debug, Clone, PartialEq)]
struct RenamedField {
    converted: String,
    nested: FieldRenames,
}

impl FieldRenames {
    /// True when applying the renames would not change any value.
    pub fn is_identity(&self) -> bool {
        self.properties
            .iter()
            .all(|(original, f)| *original == f.converted && f.nested.is_identity())
            && self.items.as_ref().map_or(true, |i| i.is_identity())
    }

    /// Original property names → converted names.
    pub fn to_upstream(&self, value: &Value) -> Value {
        if self.is_identity() {
            return value.clone();
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| match self.properties.get(key) {
                        Some(field) => (field.converted.clone(), field.nested.to_upstream(v)),
                        None => (key.clone(), v.clone()),
                    })
                    .collect(),
            ),
            Value::Array(values) => match &self.items {
                Some(items) => Value::Array(values.iter().map(|v| items.to_upstream(v)).collect()),
                None => value.clone(),
            },
            other => other.clone(),
        }
    }

    /// Converted property names → original names.
    pub fn to_original(&self, value: &Value) -> Value {
        if self.is_identity() {
            return value.clone();
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| {
                        let found = self
                            .properties
                            .iter()
                            .find(|(_, field)| field.converted == *key);
                        match found {
                            Some((original, field)) => (original.clone(), field.nested.to_original(v)),
                            None => (key.clone(), v.clone()),
                        }
                    })
                    .collect(),
            ),
            Value::Array(values) => match &self.items {
                Some(items) => Value::Array(values.iter().map(|v| items.to_original(v)).collect()),
                None => value.clone(),
            },
            other => other.clone(),
        }
    }
}

/// Convert a tool input schema. Total: always returns a usable schema.
pub fn convert_schema(schema: &Value) -> SchemaConversion {
    let mut converter = Converter {
        root: schema,
        dropped: Vec::new(),
        ref_stack: Vec::new(),
    };
    let (schema, renames) = converter.convert(schema, "#", 0);
    SchemaConversion {
        schema,
        dropped: converter.dropped,
        renames,
    }
}

struct Converter<'a> {
    root: &'a Value,
    dropped: Vec<DroppedFeature>,
    ref_stack: Vec<String>,
}

impl<'a> Converter<'a> {
    fn record(&mut self, path: &str, keyword: &str, detail: Option<String>) {
        self.dropped.push(DroppedFeature {
            path: path.to_string(),
            keyword: keyword.to_string(),
            detail,
        });
    }

    fn convert(&mut self, node: &Value, path: &str, depth: usize) -> (Value, FieldRenames) {
        let Some(source) = node.as_object() else {
            self.record(path, "schema", Some(format!("non-object schema {node} became string")));
            return (json!({"type": "string"}), FieldRenames::default());
        };
        if depth > MAX_DEPTH {
            self.record(path, "depth", Some("nesting too deep, replaced by object".to_string()));
            return (json!({"type": "object"}), FieldRenames::default());
        }

        let mut obj = source.clone();
        obj.remove("$defs");
        obj.remove("definitions");

        // Structural rewrites. Each one removes a keyword and restarts on the result.
        if let Some(reference) = obj.remove("$ref") {
            let reference = reference.as_str().unwrap_or_default().to_string();
            if self.ref_stack.contains(&reference) {
                self.record(path, "$ref", Some(format!("recursive reference {reference}")));
                obj.entry("type").or_insert_with(|| json!("object"));
            } else if let Some(Value::Object(target)) = self.lookup(&reference) {
                merge_into(&mut obj, target);
                self.ref_stack.push(reference);
                let result = self.convert(&Value::Object(obj), path, depth + 1);
                self.ref_stack.pop();
                return result;
            } else {
                self.record(path, "$ref", Some(format!("unresolvable reference {reference}")));
                obj.entry("type").or_insert_with(|| json!("object"));
            }
        }

        if let Some(members) = obj.remove("allOf") {
            for member in members.as_array().into_iter().flatten() {
                if let Some(member) = member.as_object() {
                    merge_into(&mut obj, member);
                }
            }
            return self.convert(&Value::Object(obj), path, depth + 1);
        }

        for keyword in ["anyOf", "oneOf"] {
            if let Some(variants) = obj.remove(keyword) {
                let variants = variants.as_array().cloned().unwrap_or_default();
                let (nulls, others): (Vec<&Value>, Vec<&Value>) =
                    variants.iter().partition(|v| is_null_schema(v));
                if !nulls.is_empty() {
                    obj.insert("nullable".to_string(), Value::Bool(true));
                }
                let others: Vec<&Map<String, Value>> =
                    others.into_iter().filter_map(Value::as_object).collect();
                match others.split_first() {
                    None => {
                        obj.entry("type").or_insert_with(|| json!("string"));
                    }
                    Some((first, rest)) => {
                        merge_into(&mut obj, first);
                        if !rest.is_empty() {
                            self.record(
                                path,
                                keyword,
                                Some(format!("kept first of {} alternatives", rest.len() + 1)),
                            );
                        }
                    }
                }
                return self.convert(&Value::Object(obj), path, depth + 1);
            }
        }

        self.convert_plain(&obj, path, depth)
    }

    /// Convert a schema free of `$ref` and composition keywords.
    fn convert_plain(
        &mut self,
        obj: &Map<String, Value>,
        path: &str,
        depth: usize,
    ) -> (Value, FieldRenames) {
        let mut out = Map::new();
        let mut renames = FieldRenames::default();
        let mut hints: Vec<String> = Vec::new();

        let mut nullable = obj.get("nullable").and_then(Value::as_bool).unwrap_or(false);
        let declared = match obj.get("type") {
            Some(Value::String(t)) if t.eq_ignore_ascii_case("null") => {
                nullable = true;
                None
            }
            Some(Value::String(t)) => Some(t.to_lowercase()),
            Some(Value::Array(types)) => {
                let names: Vec<String> = types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect();
                if names.iter().any(|n| n == "null") {
                    nullable = true;
                }
                let non_null: Vec<String> = names.into_iter().filter(|n| n != "null").collect();
                if non_null.len() > 1 {
                    self.record(
                        path,
                        "type",
                        Some(format!("union {} narrowed to {}", non_null.join("|"), non_null[0])),
                    );
                }
                non_null.into_iter().next()
            }
            Some(other) => {
                self.record(path, "type", Some(format!("invalid type {other}")));
                None
            }
            None => None,
        };
        let declared = match declared {
            Some(t) if SUPPORTED_TYPES.contains(&t.as_str()) => Some(t),
            Some(t) => {
                self.record(path, "type", Some(format!("unsupported type {t}")));
                None
            }
            None => None,
        };
        let ty = declared.unwrap_or_else(|| infer_type(obj).to_string());

        out.insert("type".to_string(), Value::String(ty.clone()));
        if nullable {
            out.insert("nullable".to_string(), Value::Bool(true));
        }

        for keyword in ["title", "description"] {
            match obj.get(keyword) {
                Some(Value::String(s)) => {
                    out.insert(keyword.to_string(), Value::String(s.clone()));
                }
                Some(_) => self.record(path, keyword, Some("not a string".to_string())),
                None => {}
            }
        }

        if let Some(format) = obj.get("format") {
            match (ty.as_str(), format.as_str()) {
                ("string", Some("enum" | "date-time"))
                | ("integer", Some("int32" | "int64"))
                | ("number", Some("float" | "double")) => {
                    out.insert("format".to_string(), format.clone());
                }
                (_, Some(f)) => {
                    self.record(path, "format", Some(f.to_string()));
                    hints.push(format!("format: {f}"));
                }
                (_, None) => self.record(path, "format", Some("not a string".to_string())),
            }
        }

        if let Some(values) = obj.get("enum") {
            match values.as_array() {
                Some(values)
                    if ty == "string" && !values.is_empty() && values.iter().all(Value::is_string) =>
                {
                    out.insert("enum".to_string(), Value::Array(values.clone()));
                }
                Some(values) if !values.is_empty() => {
                    self.record(path, "enum", Some(format!("non-string values on {ty}")));
                    hints.push(format!("allowed values: {}", render_values(values)));
                }
                _ => self.record(path, "enum", Some("empty or not an array".to_string())),
            }
        }

        if let Some(constant) = obj.get("const") {
            if ty == "string" && constant.is_string() && !out.contains_key("enum") {
                out.insert("enum".to_string(), Value::Array(vec![constant.clone()]));
            } else {
                self.record(path, "const", None);
                hints.push(format!("must be {}", render_values(std::slice::from_ref(constant))));
            }
        }

        let numeric = ty == "number" || ty == "integer";
        for keyword in ["minimum", "maximum"] {
            if let Some(v) = obj.get(keyword) {
                if numeric && v.is_number() {
                    out.insert(keyword.to_string(), v.clone());
                } else {
                    self.record(path, keyword, None);
                }
            }
        }
        self.exclusive_bound(obj, &mut out, path, &ty, "exclusiveMinimum", "minimum");
        self.exclusive_bound(obj, &mut out, path, &ty, "exclusiveMaximum", "maximum");

        for keyword in ["minLength", "maxLength", "pattern"] {
            if let Some(v) = obj.get(keyword) {
                let valid = if keyword == "pattern" {
                    v.is_string()
                } else {
                    v.is_u64()
                };
                if ty == "string" && valid {
                    out.insert(keyword.to_string(), v.clone());
                } else {
                    self.record(path, keyword, None);
                }
            }
        }

        for keyword in ["minItems", "maxItems"] {
            if let Some(v) = obj.get(keyword) {
                if ty == "array" && v.is_u64() {
                    out.insert(keyword.to_string(), v.clone());
                } else {
                    self.record(path, keyword, None);
                }
            }
        }

        if ty == "object" {
            if let Some(props) = obj.get("properties") {
                match props.as_object() {
                    Some(props) => {
                        let names: Vec<&str> = props.keys().map(String::as_str).collect();
                        let converted = unique_names(&names, sanitize_property_name, usize::MAX);
                        let mut out_props = Map::new();
                        for ((original, child), converted) in props.iter().zip(converted) {
                            let child_path = format!("{path}/properties/{original}");
                            let (schema, nested) = self.convert(child, &child_path, depth + 1);
                            out_props.insert(converted.clone(), schema);
                            renames
                                .properties
                                .insert(original.clone(), RenamedField { converted, nested });
                        }
                        out.insert("properties".to_string(), Value::Object(out_props));
                    }
                    None => self.record(path, "properties", Some("not an object".to_string())),
                }
            }

            if let Some(required) = obj.get("required") {
                let mut kept: Vec<Value> = Vec::new();
                for name in required.as_array().into_iter().flatten() {
                    let field = name.as_str().and_then(|n| renames.properties.get(n));
                    match field {
                        Some(field) => {
                            let converted = Value::String(field.converted.clone());
                            if !kept.contains(&converted) {
                                kept.push(converted);
                            }
                        }
                        None => self.record(
                            path,
                            "required",
                            Some(format!("unknown property {name}")),
                        ),
                    }
                }
                if !kept.is_empty() {
                    out.insert("required".to_string(), Value::Array(kept));
                }
            }
        } else {
            for keyword in ["properties", "required"] {
                if obj.contains_key(keyword) {
                    self.record(path, keyword, Some(format!("not allowed on {ty}")));
                }
            }
        }

        if ty == "array" {
            let item_path = format!("{path}/items");
            let (items, nested) = match obj.get("items") {
                Some(Value::Array(tuple)) => {
                    self.record(path, "items", Some("tuple form narrowed to first schema".to_string()));
                    match tuple.first() {
                        Some(first) => self.convert(first, &format!("{item_path}/0"), depth + 1),
                        None => (json!({"type": "string"}), FieldRenames::default()),
                    }
                }
                Some(items) => self.convert(items, &item_path, depth + 1),
                None => (json!({"type": "string"}), FieldRenames::default()),
            };
            out.insert("items".to_string(), items);
            if !nested.is_identity() {
                renames.items = Some(Box::new(nested));
            }
        } else if obj.contains_key("items") {
            self.record(path, "items", Some(format!("not allowed on {ty}")));
        }

        for keyword in obj.keys() {
            if !HANDLED_KEYWORDS.contains(&keyword.as_str()) {
                self.record(path, keyword, None);
            }
        }

        if !hints.is_empty() {
            let hint = hints.join("; ");
            let description = match out.get("description").and_then(Value::as_str) {
                Some(existing) if !existing.is_empty() => format!("{existing} ({hint})"),
                _ => format!("({hint})"),
            };
            out.insert("description".to_string(), Value::String(description));
        }

        (Value::Object(out), renames)
    }

    fn exclusive_bound(
        &mut self,
        obj: &Map<String, Value>,
        out: &mut Map<String, Value>,
        path: &str,
        ty: &str,
        keyword: &str,
        inclusive: &str,
    ) {
        let Some(bound) = obj.get(keyword) else {
            return;
        };
        let numeric = ty == "number" || ty == "integer";
        let Some(value) = bound.as_f64().filter(|_| numeric) else {
            // Draft-4 boolean form or wrong type.
            self.record(path, keyword, None);
            return;
        };

        let lower = keyword == "exclusiveMinimum";
        let converted = if ty == "integer" {
            match integer_edge(value, lower) {
                Some(edge) => json!(edge),
                None => {
                    self.record(path, keyword, Some(format!("{value} is outside the integer range")));
                    return;
                }
            }
        } else {
            bound.clone()
        };

        let stricter = match out.get(inclusive).and_then(Value::as_f64) {
            None => true,
            Some(existing) => {
                let candidate = converted.as_f64().unwrap_or(value);
                if lower {
                    candidate > existing
                } else {
                    candidate < existing
                }
            }
        };
        if stricter {
            out.insert(inclusive.to_string(), converted);
        }
    }

    fn lookup(&self, reference: &str) -> Option<&'a Value> {
        let pointer = reference.strip_prefix('#')?;
        self.root.pointer(pointer)
    }
}

/// First integer strictly inside an exclusive bound, if it fits in `i64`.
fn integer_edge(value: f64, lower: bool) -> Option<i64> {
    // 2^63; every f64 below it in magnitude converts without saturating.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    let rounded = if lower { value.floor() } else { value.ceil() };
    if !rounded.is_finite() || rounded >= LIMIT || rounded < -LIMIT {
        return None;
    }
    let rounded = rounded as i64;
    if lower {
        rounded.checked_add(1)
    } else {
        rounded.checked_sub(1)
    }
}

/// Copy keys missing from `target`. `properties` and `required` are unioned.
fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (key.as_str(), target.get_mut(key)) {
            ("properties", Some(Value::Object(existing))) => {
                if let Value::Object(incoming) = value {
                    for (name, schema) in incoming {
                        existing.entry(name.clone()).or_insert_with(|| schema.clone());
                    }
                }
            }
            ("required", Some(Value::Array(existing))) => {
                if let Value::Array(incoming) = value {
                    for name in incoming {
                        if !existing.contains(name) {
                            existing.push(name.clone());
                        }
                    }
                }
            }
            (_, Some(_)) => {}
            (_, None) => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn is_null_schema(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("null")
}

fn infer_type(obj: &Map<String, Value>) -> &'static str {
    if obj.contains_key("properties") {
        return "object";
    }
    if obj.contains_key("items") || obj.contains_key("minItems") || obj.contains_key("maxItems") {
        return "array";
    }
    let sample = obj
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|values| values.iter().find(|v| !v.is_null()))
        .or_else(|| obj.get("const"));
    match sample {
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(n)) if n.is_f64() => "number",
        Some(Value::Number(_)) => "integer",
        Some(_) => "string",
        None if obj.contains_key("minimum") || obj.contains_key("maximum") => "number",
        None => "string",
    }
}

fn render_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Property names: `[A-Za-z0-9_.-]+`, not starting with a digit.
pub fn sanitize_property_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        return "field".to_string();
    }
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("_{cleaned}");
    }
    cleaned
}

/// Function names: start with a letter or underscore, then `[A-Za-z0-9_.:-]`, at most 64 chars.
pub fn sanitize_function_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        cleaned.push_str("tool");
    }
    if !cleaned.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        cleaned.insert(0, '_');
    }
    truncate_chars(&cleaned, 64).to_string()
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Make names valid and unique, keeping already valid names untouched.
///
/// Rewritten names that collide get `_2`, `_3`, ... appended. The result is
/// positionally aligned with `names` and depends only on its contents.
pub(crate) fn unique_names(
    names: &[&str],
    sanitize: impl Fn(&str) -> String,
    max_len: usize,
) -> Vec<String> {
    let valid: Vec<bool> = names.iter().map(|n| sanitize(n) == *n).collect();
    let mut taken: HashSet<String> = names
        .iter()
        .zip(&valid)
        .filter(|(_, ok)| **ok)
        .map(|(n, _)| n.to_string())
        .collect();
    let mut kept: HashSet<&str> = HashSet::new();

    names
        .iter()
        .zip(&valid)
        .map(|(&name, &ok)| {
            if ok && kept.insert(name) {
                return name.to_string();
            }
            let base = sanitize(name);
            if !ok && taken.insert(base.clone()) {
                return base;
            }
            let mut n = 2usize;
            loop {
                let suffix = format!("_{n}");
                let room = max_len.saturating_sub(suffix.len());
                let candidate = format!("{}{}", truncate_chars(&base, room), suffix);
                if taken.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(conv: &SchemaConversion) -> Vec<&str> {
        conv.dropped.iter().map(|d| d.keyword.as_str()).collect()
    }

    #[test]
    fn test_simple_object_is_preserved() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": {"type": "string", "description": "City name"},
                "days": {"type": "integer", "minimum": 1, "maximum": 14}
            },
            "required": ["city"]
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema, schema);
        assert!(conv.dropped.is_empty());
        assert!(conv.renames.is_identity());
    }

    #[test]
    fn test_unsupported_keywords_are_dropped_and_recorded() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "url": {"type": "string", "format": "uri", "default": "x"},
                "n": {"type": "integer", "exclusiveMinimum": 0, "multipleOf": 2}
            }
        });
        let conv = convert_schema(&schema);
        let dropped = keywords(&conv);
        assert!(dropped.contains(&"$schema"));
        assert!(dropped.contains(&"additionalProperties"));
        assert!(dropped.contains(&"format"));
        assert!(dropped.contains(&"default"));
        assert!(dropped.contains(&"multipleOf"));

        let url = &conv.schema["properties"]["url"];
        assert!(url.get("format").is_none());
        assert_eq!(url["description"], "(format: uri)");
        assert_eq!(conv.schema["properties"]["n"]["minimum"], 1);
        assert!(conv.schema.get("additionalProperties").is_none());
    }

    #[test]
    fn test_out_of_range_integer_bounds_are_dropped() {
        let schema = json!({
            "type": "object",
            "properties": {
                "big": {"type": "integer", "exclusiveMinimum": 1e19},
                "small": {"type": "integer", "exclusiveMaximum": -1e19},
                "edge": {"type": "integer", "exclusiveMaximum": 9.3e18, "exclusiveMinimum": -0.5}
            }
        });
        let conv = convert_schema(&schema);
        let props = &conv.schema["properties"];
        assert!(props["big"].get("minimum").is_none());
        assert!(props["small"].get("maximum").is_none());
        assert!(props["edge"].get("maximum").is_none());
        assert_eq!(props["edge"]["minimum"], 0);

        let dropped: Vec<(&str, &str)> = conv
            .dropped
            .iter()
            .map(|d| (d.path.as_str(), d.keyword.as_str()))
            .collect();
        assert_eq!(dropped.len(), 3);
        assert!(dropped.iter().any(|(_, k)| *k == "exclusiveMinimum"));
        assert_eq!(dropped.iter().filter(|(_, k)| *k == "exclusiveMaximum").count(), 2);
    }

    #[test]
    fn test_integer_edge() {
        assert_eq!(integer_edge(0.0, true), Some(1));
        assert_eq!(integer_edge(2.5, true), Some(3));
        assert_eq!(integer_edge(10.0, false), Some(9));
        assert_eq!(integer_edge(-9_223_372_036_854_775_808.0, false), None);
        assert_eq!(integer_edge(1e19, true), None);
        assert_eq!(integer_edge(f64::NAN, true), None);
    }

    #[test]
    fn test_nullable_unions() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": ["string", "null"]},
                "b": {"anyOf": [{"type": "integer"}, {"type": "null"}], "description": "count"}
            }
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema["properties"]["a"], json!({"type": "string", "nullable": true}));
        assert_eq!(
            conv.schema["properties"]["b"],
            json!({"type": "integer", "nullable": true, "description": "count"})
        );
        assert!(conv.dropped.is_empty());
    }

    #[test]
    fn test_one_of_keeps_first_branch() {
        let schema = json!({"oneOf": [{"type": "string"}, {"type": "number"}]});
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema, json!({"type": "string"}));
        assert_eq!(keywords(&conv), vec!["oneOf"]);
    }

    #[test]
    fn test_refs_are_inlined() {
        let schema = json!({
            "type": "object",
            "properties": {"point": {"$ref": "#/$defs/Point"}},
            "$defs": {
                "Point": {
                    "type": "object",
                    "properties": {"x": {"type": "number"}, "y": {"type": "number"}},
                    "required": ["x", "y"]
                }
            }
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema["properties"]["point"]["properties"]["x"]["type"], "number");
        assert_eq!(conv.schema["properties"]["point"]["required"], json!(["x", "y"]));
        assert!(conv.schema.get("$defs").is_none());
        assert!(conv.dropped.is_empty());
    }

    #[test]
    fn test_recursive_ref_terminates() {
        let schema = json!({
            "$ref": "#/definitions/Node",
            "definitions": {
                "Node": {
                    "type": "object",
                    "properties": {"child": {"$ref": "#/definitions/Node"}}
                }
            }
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema["type"], "object");
        assert!(keywords(&conv).contains(&"$ref"));
    }

    #[test]
    fn test_all_of_merges() {
        let schema = json!({
            "allOf": [
                {"type": "object", "properties": {"a": {"type": "string"}}, "required": ["a"]},
                {"properties": {"b": {"type": "boolean"}}, "required": ["b"]}
            ]
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema["properties"]["b"]["type"], "boolean");
        assert_eq!(conv.schema["required"], json!(["a", "b"]));
    }

    #[test]
    fn test_const_and_numeric_enum() {
        let schema = json!({
            "type": "object",
            "properties": {
                "kind": {"const": "circle"},
                "level": {"type": "integer", "enum": [1, 2, 3]}
            }
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema["properties"]["kind"], json!({"type": "string", "enum": ["circle"]}));
        let level = &conv.schema["properties"]["level"];
        assert!(level.get("enum").is_none());
        assert_eq!(level["description"], "(allowed values: 1, 2, 3)");
    }

    #[test]
    fn test_array_defaults_and_required_filtering() {
        let schema = json!({
            "type": "object",
            "properties": {"tags": {"type": "array"}},
            "required": ["tags", "missing"]
        });
        let conv = convert_schema(&schema);
        assert_eq!(conv.schema["properties"]["tags"]["items"], json!({"type": "string"}));
        assert_eq!(conv.schema["required"], json!(["tags"]));
        assert_eq!(keywords(&conv), vec!["required"]);
    }

    #[test]
    fn test_property_renames_are_invertible() {
        let schema = json!({
            "type": "object",
            "properties": {
                "file path": {"type": "string"},
                "file_path": {"type": "string"},
                "1st": {"type": "boolean"},
                "opts": {
                    "type": "array",
                    "items": {"type": "object", "properties": {"$key": {"type": "string"}}}
                }
            },
            "required": ["file path"]
        });
        let conv = convert_schema(&schema);
        let props = conv.schema["properties"].as_object().unwrap();
        assert!(props.contains_key("file_path"));
        assert!(props.contains_key("file_path_2"));
        assert!(props.contains_key("_1st"));
        assert!(!props.contains_key("1st"));
        assert_eq!(conv.schema["required"], json!(["file_path_2"]));
        assert!(conv.schema["properties"]["opts"]["items"]["properties"]
            .get("_key")
            .is_some());

        let original = json!({"file path": "/a", "file_path": "/b", "1st": true, "opts": [{"$key": "v"}]});
        let upstream = conv.renames.to_upstream(&original);
        assert_eq!(
            upstream,
            json!({"file_path_2": "/a", "file_path": "/b", "_1st": true, "opts": [{"_key": "v"}]})
        );
        assert_eq!(conv.renames.to_original(&upstream), original);
    }

    #[test]
    fn test_conversion_is_idempotent() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a b": {"type": ["integer", "null"], "exclusiveMaximum": 10, "format": "uint8"},
                "when": {"type": "string", "format": "date-time"},
                "list": {"items": {"anyOf": [{"$ref": "#/$defs/X"}, {"type": "null"}]}},
                "mode": {"enum": ["a", "b"]}
            },
            "required": ["a b", "list"],
            "$defs": {"X": {"type": "object", "properties": {"k": {"type": "string"}}}}
        });
        let first = convert_schema(&schema);
        let second = convert_schema(&first.schema);
        assert_eq!(first.schema, second.schema);
        assert!(second.dropped.is_empty());
        assert!(second.renames.is_identity());
    }

    #[test]
    fn test_non_object_schema_never_fails() {
        let conv = convert_schema(&json!(true));
        assert_eq!(conv.schema, json!({"type": "string"}));
        assert_eq!(conv.dropped.len(), 1);
    }

    #[test]
    fn test_function_name_sanitizing() {
        assert_eq!(sanitize_function_name("get_weather"), "get_weather");
        assert_eq!(sanitize_function_name("mcp__server/tool"), "mcp__server_tool");
        assert_eq!(sanitize_function_name("1st"), "_1st");
        assert_eq!(sanitize_function_name(&"x".repeat(80)).len(), 64);
    }

    #[test]
    fn test_unique_names_keeps_valid_and_suffixes_collisions() {
        let names = ["a-b", "a b", "a/b", "ok"];
        let out = unique_names(&names, sanitize_function_name, 64);
        assert_eq!(out, vec!["a-b", "a_b", "a_b_2", "ok"]);
    }
}
