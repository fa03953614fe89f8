//! Tool call validation against the schema registry

use thiserror::Error;

use super::schema::{FieldType, ToolSchemaRegistry};
use super::{Stage, ToolCall};

/// First validation failure found for a call (fail-fast)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool '{tool}' not found in server '{server}' schemas")]
    SchemaNotFound { tool: String, server: String },
    #[error("missing required argument(s): {}", fields.join(", "))]
    MissingRequired { fields: Vec<String> },
    #[error("invalid type for '{field}': expected {expected}")]
    InvalidType { field: String, expected: FieldType },
    #[error("unexpected argument(s): {}", fields.join(", "))]
    UnexpectedArguments { fields: Vec<String> },
}

impl ValidationError {
    /// Pipeline stage this failure is reported under.
    pub fn stage(&self) -> Stage {
        match self {
            ValidationError::UnknownTool(_) => Stage::Routing,
            _ => Stage::Validation,
        }
    }
}

/// Checks candidate calls against the static schema registry
pub struct ToolCallValidator<'a> {
    registry: &'a ToolSchemaRegistry,
}

impl<'a> ToolCallValidator<'a> {
    pub fn new(registry: &'a ToolSchemaRegistry) -> Self {
        Self { registry }
    }

    /// Validate one call. Returns the first failure found, or Ok.
    ///
    /// A server that declared no schema set at all is tolerated with a
    /// warning rather than a hard failure, so partially configured
    /// installations can still route calls through.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ValidationError> {
        let server = self
            .registry
            .server_for(&call.name)
            .ok_or_else(|| ValidationError::UnknownTool(call.name.clone()))?;

        if !self.registry.has_schemas_for(server) {
            tracing::warn!(
                server,
                tool = %call.name,
                "No schemas loaded for server, skipping validation"
            );
            return Ok(());
        }

        let schema = self
            .registry
            .schema_for(server, &call.name)
            .ok_or_else(|| ValidationError::SchemaNotFound {
                tool: call.name.clone(),
                server: server.to_string(),
            })?;

        let missing: Vec<String> = schema
            .required
            .iter()
            .filter(|field| !call.arguments.contains_key(*field))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingRequired { fields: missing });
        }

        for (field, value) in &call.arguments {
            if let Some(expected) = schema.properties.get(field) {
                if !expected.matches(value) {
                    return Err(ValidationError::InvalidType {
                        field: field.clone(),
                        expected: *expected,
                    });
                }
            }
        }

        if !schema.additional_properties {
            let unexpected: Vec<String> = call
                .arguments
                .keys()
                .filter(|key| !schema.properties.contains_key(*key))
                .cloned()
                .collect();
            if !unexpected.is_empty() {
                return Err(ValidationError::UnexpectedArguments { fields: unexpected });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::ToolSchema;
    use serde_json::{json, Map};

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(name, args.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_unknown_tool_is_routing_stage() {
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        let err = validator.validate(&call("no_such_tool", json!({}))).unwrap_err();
        assert_eq!(err, ValidationError::UnknownTool("no_such_tool".to_string()));
        assert_eq!(err.stage(), Stage::Routing);
    }

    #[test]
    fn test_missing_required_argument() {
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        let err = validator.validate(&call("save_file", json!({}))).unwrap_err();
        assert_eq!(err.stage(), Stage::Validation);
        assert_eq!(
            err.to_string(),
            "missing required argument(s): file_path"
        );

        assert!(validator
            .validate(&call("save_file", json!({"file_path": "/tmp/a.txt"})))
            .is_ok());
    }

    #[test]
    fn test_invalid_type() {
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        let err = validator
            .validate(&call("set_volume", json!({"level": "loud"})))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid type for 'level': expected integer");

        assert!(validator
            .validate(&call("set_volume", json!({"level": 80})))
            .is_ok());
    }

    #[test]
    fn test_unexpected_arguments_when_closed() {
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        let err = validator
            .validate(&call("rag_get_status", json!({"bogus": 1})))
            .unwrap_err();
        assert_eq!(err.to_string(), "unexpected argument(s): bogus");

        // Editor schemas are open; extra arguments pass through
        assert!(validator
            .validate(&call("get_text", json!({"bogus": 1})))
            .is_ok());
    }

    #[test]
    fn test_stock_server_argument_names() {
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        assert!(validator
            .validate(&call("insert_text", json!({"position": 4, "text": "hi"})))
            .is_ok());
        assert!(validator
            .validate(&call("search_stations", json!({"query": "jazz", "limit": 5})))
            .is_ok());
        assert!(validator
            .validate(&call("play_station", json!({"station_name": "FIP"})))
            .is_ok());
        assert!(validator
            .validate(&call("take_screenshot", json!({"filename": "shot.png"})))
            .is_ok());
        assert!(validator
            .validate(&call("rag_query", json!({"query": "ports", "max_results": 3})))
            .is_ok());
    }

    #[test]
    fn test_routed_tool_without_schema_fails_lookup() {
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        let err = validator
            .validate(&call("get_current_station", json!({})))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::SchemaNotFound {
                tool: "get_current_station".to_string(),
                server: "radio_player".to_string(),
            }
        );
        assert_eq!(err.stage(), Stage::Validation);
    }

    #[test]
    fn test_open_schema_allows_extra_arguments() {
        let mut registry = ToolSchemaRegistry::new();
        registry.add_server_schemas(
            "custom",
            vec![ToolSchema::new("loose_tool").required("x", FieldType::String)],
        );
        let validator = ToolCallValidator::new(&registry);

        assert!(validator
            .validate(&call("loose_tool", json!({"x": "a", "extra": true})))
            .is_ok());
    }

    #[test]
    fn test_server_without_schemas_skips_validation() {
        // Routing entry only, no schema set for the server
        let server = crate::config::ToolServerConfig {
            name: "bare".to_string(),
            path: "/opt/bare".to_string(),
            args: vec![],
            env: Default::default(),
            port: None,
            description: String::new(),
            enabled: true,
            auto_start: false,
            capabilities: vec!["mystery_tool".to_string()],
            tools: vec![],
            restart_on_failure: false,
            max_restart_attempts: 3,
            process_id: None,
        };
        let registry = ToolSchemaRegistry::from_servers([&server]);

        let validator = ToolCallValidator::new(&registry);
        assert!(validator
            .validate(&call("mystery_tool", json!({"anything": "goes"})))
            .is_ok());
    }

    #[test]
    fn test_fail_fast_reports_missing_before_type() {
        let mut args = Map::new();
        args.insert("position".to_string(), json!("not an int"));
        let registry = ToolSchemaRegistry::builtin();
        let validator = ToolCallValidator::new(&registry);

        // insert_text requires position and text; text is missing while
        // position also has the wrong type. Missing-required wins.
        let err = validator
            .validate(&ToolCall::new("insert_text", args))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingRequired { .. }));
    }
}
