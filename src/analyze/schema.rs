//! Actor payload schema: what we ask the model for, and the strict check of what
//! comes back. The response is untrusted until `validate_payload` accepts it.

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::analyze::ActorRecord;
use crate::error::ExtractionFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    #[serde(rename = "Political Turmoil")]
    PoliticalTurmoil,
    #[serde(rename = "New Product Announced")]
    NewProductAnnounced,
    #[serde(rename = "Leadership Change")]
    LeadershipChange,
    #[serde(rename = "Housing Issues")]
    HousingIssues,
    #[serde(rename = "Others")]
    Others,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::PoliticalTurmoil,
        EventCategory::NewProductAnnounced,
        EventCategory::LeadershipChange,
        EventCategory::HousingIssues,
        EventCategory::Others,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::PoliticalTurmoil => "Political Turmoil",
            EventCategory::NewProductAnnounced => "New Product Announced",
            EventCategory::LeadershipChange => "Leadership Change",
            EventCategory::HousingIssues => "Housing Issues",
            EventCategory::Others => "Others",
        }
    }

    /// Case-insensitive; anything unrecognised lands in `Others`.
    pub fn from_label(label: &str) -> Self {
        let l = label.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(l))
            .unwrap_or(EventCategory::Others)
    }
}

/// Wire shape of one actor. Only used to generate the response schema.
#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ActorPayload {
    /// The name of the actor.
    actor_name: String,
    /// The role of the actor in the event.
    actor_role: String,
    /// Whether the actor is one of the main actors of the event.
    is_main_actor: bool,
    /// Category of the event: Political Turmoil, New Product Announced,
    /// Leadership Change, Housing Issues or Others.
    category: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ActorEnvelope {
    actors: Vec<ActorPayload>,
}

/// `response_format` for OpenAI structured output.
///
/// OpenAI strict mode wants `additionalProperties: false` and every property in
/// `required` on each object, and no `$ref`s.
pub fn openai_response_format() -> Value {
    let mut schema = serde_json::to_value(schema_for!(ActorEnvelope)).unwrap_or_default();
    let definitions = schema.get("definitions").cloned().unwrap_or(Value::Null);
    inline_refs(&mut schema, &definitions);
    fix_object_schemas(&mut schema);
    if let Value::Object(map) = &mut schema {
        map.remove("definitions");
        map.remove("$schema");
        map.remove("title");
    }

    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": "actor_extraction",
            "strict": true,
            "schema": schema,
        }
    })
}

fn fix_object_schemas(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type") == Some(&Value::String("object".to_string())) {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let keys = props.keys().cloned().map(Value::String).collect();
                    map.insert("required".to_string(), Value::Array(keys));
                }
            }
            for (_, v) in map.iter_mut() {
                fix_object_schemas(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(fix_object_schemas),
        _ => {}
    }
}

fn inline_refs(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/definitions/"))
                .and_then(|name| definitions.get(name))
                .cloned();
            if let Some(mut def) = target {
                inline_refs(&mut def, definitions);
                *value = def;
                return;
            }
            for (_, v) in map.iter_mut() {
                inline_refs(v, definitions);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| inline_refs(v, definitions)),
        _ => {}
    }
}

/// Turn a raw model response into actor records, or say exactly why not.
///
/// Accepts the bare list `[{actor_name, actor_role, is_main_actor, category}]`
/// or the structured-output envelope `{"actors": [...]}`. `category` may be
/// absent or null; the other three fields are required with exact types.
pub fn validate_payload(news_id: &str, raw: &str) -> Result<Vec<ActorRecord>, ExtractionFailure> {
    let schema_err = |detail: String| ExtractionFailure::Schema(detail);

    let text = strip_code_fence(raw);
    if text.is_empty() {
        return Err(schema_err("empty response".to_string()));
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| schema_err(format!("not JSON: {e}")))?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("actors") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(schema_err("`actors` is not a list".to_string())),
            None => return Err(schema_err("object without `actors` list".to_string())),
        },
        _ => return Err(schema_err("expected a list of actors".to_string())),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let obj = item
                .as_object()
                .ok_or_else(|| schema_err(format!("actor #{i} is not an object")))?;
            actor_from_object(news_id, i, obj).map_err(schema_err)
        })
        .collect()
}

fn actor_from_object(
    news_id: &str,
    i: usize,
    obj: &Map<String, Value>,
) -> Result<ActorRecord, String> {
    let text_field = |key: &str| -> Result<String, String> {
        match obj.get(key) {
            Some(Value::String(s)) => Ok(sanitize_text(s)),
            Some(other) => Err(format!(
                "actor #{i}: `{key}` must be a string, got {}",
                kind(other)
            )),
            None => Err(format!("actor #{i}: missing `{key}`")),
        }
    };

    let name = text_field("actor_name")?;
    if name.is_empty() {
        return Err(format!("actor #{i}: `actor_name` is empty"));
    }
    let role = text_field("actor_role")?;

    let is_main_actor = match obj.get("is_main_actor") {
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(format!(
                "actor #{i}: `is_main_actor` must be a boolean, got {}",
                kind(other)
            ))
        }
        None => return Err(format!("actor #{i}: missing `is_main_actor`")),
    };

    let category = match obj.get("category") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(EventCategory::from_label(s)),
        Some(other) => {
            return Err(format!(
                "actor #{i}: `category` must be a string or null, got {}",
                kind(other)
            ))
        }
    };

    Ok(ActorRecord {
        news_id: news_id.to_string(),
        name,
        role,
        is_main_actor,
        category,
    })
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Models like to wrap JSON in markdown fences.
fn strip_code_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Single line, collapsed whitespace, no control characters.
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() || ch.is_control() { ' ' } else { ch };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out.trim_end().to_string()
}
