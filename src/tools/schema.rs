//! Static tool schema registry
//!
//! Built once at startup from the persisted server registry (and/or the
//! built-in defaults) and never mutated afterwards. Keyed by tool name, it
//! answers two questions on the hot path without any file I/O: which server
//! owns a tool, and what arguments that tool accepts.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ToolServerConfig;

/// Declared runtime type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    /// Check whether a JSON value matches this declared type.
    ///
    /// `number` accepts integers as well, mirroring JSON Schema semantics;
    /// `integer` does not accept floats.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Number => write!(f, "number"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Object => write!(f, "object"),
            FieldType::Array => write!(f, "array"),
        }
    }
}

/// Argument schema for one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, FieldType>,
    /// When false, arguments outside `properties` are rejected
    #[serde(default = "default_true")]
    pub additional_properties: bool,
}

fn default_true() -> bool {
    true
}

impl ToolSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            properties: BTreeMap::new(),
            additional_properties: true,
        }
    }

    pub fn required(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        let field = field.into();
        self.required.push(field.clone());
        self.properties.insert(field, ty);
        self
    }

    pub fn optional(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.properties.insert(field.into(), ty);
        self
    }

    pub fn closed(mut self) -> Self {
        self.additional_properties = false;
        self
    }
}

/// Immutable tool name → schema table, grouped by owning server
#[derive(Debug, Default)]
pub struct ToolSchemaRegistry {
    /// tool name → owning server
    routing: HashMap<String, String>,
    /// server name → tool name → schema
    schemas: HashMap<String, HashMap<String, ToolSchema>>,
}

impl ToolSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from persisted server configurations.
    ///
    /// Servers with an empty tools list still get a routing entry for each
    /// capability-declared tool name but no schema set; the validator treats
    /// that as "schemas unavailable" and skips strict validation.
    pub fn from_servers<'a>(servers: impl IntoIterator<Item = &'a ToolServerConfig>) -> Self {
        let mut registry = Self::new();
        for server in servers {
            if server.tools.is_empty() {
                for tool in &server.capabilities {
                    registry.route(tool, &server.name);
                }
            } else {
                registry.add_server_schemas(&server.name, server.tools.clone());
            }
        }
        registry
    }

    /// Built-in schema table for the suite's stock tool servers.
    ///
    /// `save_file` requires `file_path` here even though the live editor
    /// treats it as optional; a save without a target is never what the
    /// model meant. `create_document` is routable but the editor declares
    /// no schema for it, so one is declared here to keep the inference
    /// fallback validatable.
    pub fn builtin() -> Self {
        use FieldType::*;

        let mut registry = Self::new();

        registry.add_server_schemas(
            "word_editor",
            vec![
                ToolSchema::new("set_text").required("text", String),
                ToolSchema::new("insert_text")
                    .required("position", Integer)
                    .required("text", String),
                ToolSchema::new("append_text").required("text", String),
                ToolSchema::new("get_text"),
                ToolSchema::new("open_file").required("file_path", String),
                ToolSchema::new("save_file")
                    .required("file_path", String)
                    .optional("content", String),
                ToolSchema::new("create_document")
                    .required("file_path", String)
                    .required("text", String),
                ToolSchema::new("send_cli_command")
                    .required("command", String)
                    .optional("args", Array),
                ToolSchema::new("check_gui_status"),
            ],
        );
        // Routable but declared by no schema set; validation reports these
        // as missing from their server's schemas.
        registry.route("replace_text", "word_editor");
        registry.route("navigate_to", "browser");
        for tool in [
            "get_current_station",
            "add_favorite_station",
            "remove_favorite_station",
            "list_favorite_stations",
            "get_popular_stations",
        ] {
            registry.route(tool, "radio_player");
        }

        registry.add_server_schemas(
            "browser",
            vec![
                ToolSchema::new("open_url").required("url", String),
                ToolSchema::new("navigate_back"),
                ToolSchema::new("navigate_forward"),
                ToolSchema::new("reload_page"),
                ToolSchema::new("add_bookmark")
                    .optional("url", String)
                    .optional("name", String),
                ToolSchema::new("get_bookmarks"),
                ToolSchema::new("click_element").required("selector", String),
                ToolSchema::new("click_text").required("text", String),
                ToolSchema::new("get_page_html"),
                ToolSchema::new("summarize_page"),
                ToolSchema::new("fill_form").required("form_data", Object),
                ToolSchema::new("get_page_content").optional("format", String),
                ToolSchema::new("take_screenshot").optional("filename", String),
                ToolSchema::new("enable_adblock"),
                ToolSchema::new("disable_adblock"),
                ToolSchema::new("get_adblock_status"),
                ToolSchema::new("adblock_enable"),
                ToolSchema::new("adblock_disable"),
                ToolSchema::new("adblock_toggle"),
                ToolSchema::new("adblock_status"),
                ToolSchema::new("adblock_load_rules")
                    .required("path", String)
                    .optional("is_directory", Boolean),
                ToolSchema::new("adblock_fetch_easylist").optional("url", String),
            ],
        );

        registry.add_server_schemas(
            "radio_player",
            vec![
                ToolSchema::new("play_station")
                    .optional("station_url", String)
                    .optional("station_name", String),
                ToolSchema::new("stop_playback"),
                ToolSchema::new("pause_playback"),
                ToolSchema::new("resume_playback"),
                ToolSchema::new("get_playback_status"),
                ToolSchema::new("add_station")
                    .required("name", String)
                    .required("url", String)
                    .optional("genre", String)
                    .optional("country", String),
                ToolSchema::new("remove_station").required("name", String),
                ToolSchema::new("list_stations"),
                ToolSchema::new("get_station_info").required("name", String),
                ToolSchema::new("search_stations")
                    .required("query", String)
                    .optional("limit", Integer),
                ToolSchema::new("search_by_genre")
                    .required("genre", String)
                    .optional("limit", Integer),
                ToolSchema::new("search_by_country")
                    .required("country", String)
                    .optional("limit", Integer),
                ToolSchema::new("set_volume").required("level", Integer),
                ToolSchema::new("get_volume"),
                ToolSchema::new("mute_audio"),
                ToolSchema::new("unmute_audio"),
            ],
        );

        registry.add_server_schemas(
            "rag",
            vec![
                ToolSchema::new("rag_index_all")
                    .optional("force_reindex", Boolean)
                    .closed(),
                ToolSchema::new("rag_add_document").required("file_path", String).closed(),
                ToolSchema::new("rag_delete_document").required("file_path", String).closed(),
                ToolSchema::new("rag_query")
                    .required("query", String)
                    .optional("max_results", Integer)
                    .optional("include_metadata", Boolean)
                    .closed(),
                ToolSchema::new("rag_interactive_query")
                    .optional("initial_query", String)
                    .closed(),
                ToolSchema::new("rag_start_watching")
                    .optional("watch_directory", String)
                    .closed(),
                ToolSchema::new("rag_stop_watching").closed(),
                ToolSchema::new("rag_health_check").optional("detailed", Boolean).closed(),
                ToolSchema::new("rag_get_status").optional("include_stats", Boolean).closed(),
            ],
        );

        registry
    }

    /// Register a routing entry without a schema.
    fn route(&mut self, tool: &str, server: &str) {
        self.routing.insert(tool.to_string(), server.to_string());
    }

    /// Register a server's full schema set.
    pub fn add_server_schemas(&mut self, server: &str, tools: Vec<ToolSchema>) {
        let entry = self.schemas.entry(server.to_string()).or_default();
        for schema in tools {
            self.routing.insert(schema.name.clone(), server.to_string());
            entry.insert(schema.name.clone(), schema);
        }
    }

    /// Which server owns this tool, if any.
    pub fn server_for(&self, tool: &str) -> Option<&str> {
        self.routing.get(tool).map(String::as_str)
    }

    /// Whether a schema set was loaded for this server at all.
    pub fn has_schemas_for(&self, server: &str) -> bool {
        self.schemas.contains_key(server)
    }

    /// Schema for one tool on one server.
    pub fn schema_for(&self, server: &str, tool: &str) -> Option<&ToolSchema> {
        self.schemas.get(server).and_then(|tools| tools.get(tool))
    }

    pub fn is_empty(&self) -> bool {
        self.routing.is_empty()
    }

    /// All known tool names, sorted (for diagnostics).
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routing.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
