//! JSON Schema rendering of API definitions, for tooling outside the bus.

use serde_json::{json, Map, Value};
use wirebus_types::{ApiDefinition, ParamType, Parameter};

const DRAFT: &str = "http://json-schema.org/draft-07/schema#";

fn type_schema(kind: ParamType) -> Value {
    match kind {
        ParamType::Any => json!({}),
        other => json!({ "type": other.name() }),
    }
}

fn parameters_schema(title: String, parameters: &[Parameter]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in parameters {
        properties.insert(param.name.clone(), type_schema(param.kind));
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    json!({
        "$schema": DRAFT,
        "title": title,
        "type": "object",
        "additionalProperties": false,
        "properties": properties,
        "required": required,
    })
}

/// Render `api` as a document of JSON Schemas: one parameter schema per
/// RPC and event, and a response schema for RPCs that declare one.
pub fn to_json_schema(api: &ApiDefinition) -> Value {
    let mut rpcs = Map::new();
    for rpc in api.rpcs() {
        let mut entry = Map::new();
        entry.insert(
            "parameters".into(),
            parameters_schema(
                format!("RPC {}.{}() parameters", api.name(), rpc.name),
                &rpc.parameters,
            ),
        );
        if let Some(kind) = rpc.returns {
            let mut response = type_schema(kind);
            if let Value::Object(map) = &mut response {
                map.insert("$schema".into(), json!(DRAFT));
                let title = format!("RPC {}.{}() response", api.name(), rpc.name);
                map.insert("title".into(), json!(title));
            }
            entry.insert("response".into(), response);
        }
        rpcs.insert(rpc.name.clone(), Value::Object(entry));
    }

    let mut events = Map::new();
    for event in api.events() {
        events.insert(
            event.name.clone(),
            json!({
                "parameters": parameters_schema(
                    format!("Event {}.{} parameters", api.name(), event.name),
                    &event.parameters,
                )
            }),
        );
    }

    json!({ "name": api.name(), "rpcs": rpcs, "events": events })
}
