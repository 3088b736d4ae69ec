use serde_json::{json, Map, Value};

// Helper to create a JSON schema property
fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_prop_with_default_bool(type_str: &str, description: &str, default_val: bool) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "default": default_val
    })
}

fn create_bounded_prop(type_str: &str, description: &str, minimum: f64, maximum: f64) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "minimum": minimum,
        "maximum": maximum
    })
}

fn create_array_prop(item_type_str: &str, description: &str) -> Value {
    json!({
        "type": "array",
        "items": { "type": item_type_str },
        "description": description
    })
}

fn rect_prop(description: &str) -> Value {
    json!({
        "type": "object",
        "description": description,
        "properties": {
            "x": { "type": "number" },
            "y": { "type": "number" },
            "width": { "type": "number", "exclusiveMinimum": 0 },
            "height": { "type": "number", "exclusiveMinimum": 0 }
        },
        "required": ["x", "y", "width", "height"]
    })
}

fn input_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

const PATH_GUIDANCE: &str = "Use absolute or tilde-expanded (~/...) paths.";
const SESSION_ID: &str = "Session id as returned by create_session.";

pub fn create_session_schema() -> Value {
    input_schema(
        &["working_dir"],
        vec![
            ("working_dir", create_prop("string", &format!("Directory the session runs in. {}", PATH_GUIDANCE))),
            ("title", create_prop("string", "Display title. Defaults to the directory name.")),
            ("is_popup", create_prop_with_default_bool("boolean", "Whether the session is shown as a popup.", false)),
            ("position", rect_prop("Initial bounding rectangle.")),
            ("opacity", create_bounded_prop("number", "Initial opacity.", 0.0, 1.0)),
            ("program", create_prop("string", "Program to run instead of the default shell.")),
            ("args", create_array_prop("string", "Arguments for 'program'.")),
        ],
    )
}

pub fn get_session_schema() -> Value {
    input_schema(
        &["session_id"],
        vec![
            ("session_id", create_prop("string", SESSION_ID)),
            ("tail", create_prop("integer", "Only return the last N output chunks.")),
        ],
    )
}

pub fn list_sessions_schema() -> Value {
    input_schema(
        &[],
        vec![(
            "include_output",
            create_prop_with_default_bool("boolean", "Include buffered output for every session.", false),
        )],
    )
}

pub fn session_id_schema() -> Value {
    input_schema(&["session_id"], vec![("session_id", create_prop("string", SESSION_ID))])
}

pub fn send_input_schema() -> Value {
    input_schema(
        &["session_id", "text"],
        vec![
            ("session_id", create_prop("string", SESSION_ID)),
            ("text", create_prop("string", "Text to write to the session's input. A newline is appended if missing.")),
        ],
    )
}

pub fn update_position_schema() -> Value {
    input_schema(
        &["session_id", "position"],
        vec![
            ("session_id", create_prop("string", SESSION_ID)),
            ("position", rect_prop("New bounding rectangle.")),
        ],
    )
}

pub fn set_opacity_schema() -> Value {
    input_schema(
        &["session_id", "opacity"],
        vec![
            ("session_id", create_prop("string", SESSION_ID)),
            ("opacity", create_bounded_prop("number", "Opacity between 0 and 1.", 0.0, 1.0)),
        ],
    )
}

pub fn set_popup_schema() -> Value {
    input_schema(
        &["session_id", "is_popup"],
        vec![
            ("session_id", create_prop("string", SESSION_ID)),
            ("is_popup", create_prop("boolean", "Popup flag.")),
        ],
    )
}

pub fn dispatch_command_schema() -> Value {
    input_schema(
        &["session_id", "input"],
        vec![
            ("session_id", create_prop("string", SESSION_ID)),
            ("input", create_prop("string", "Natural-language command for the session's capability provider.")),
        ],
    )
}

pub fn probe_project_schema() -> Value {
    input_schema(
        &["path"],
        vec![("path", create_prop("string", &format!("Directory to classify. {}", PATH_GUIDANCE)))],
    )
}

pub fn empty_schema() -> Value {
    input_schema(&[], Vec::new())
}

pub fn set_limits_schema() -> Value {
    input_schema(
        &[],
        vec![
            ("max_sessions", create_prop("integer", "Maximum number of live sessions.")),
            ("session_memory_budget_mb", create_prop("integer", "Per-session memory budget in MiB.")),
            ("cpu_alert_fraction", create_bounded_prop("number", "CPU share above which a resource alert is raised.", 0.0, 1.0)),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_are_objects_with_required_lists() {
        let schema = send_input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["session_id", "text"]));
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(empty_schema()["required"], json!([]));
        assert_eq!(create_session_schema()["properties"]["position"]["required"].as_array().unwrap().len(), 4);
    }
}
