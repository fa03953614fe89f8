//! Line-delimited JSON wire types for the coordination server
//!
//! One request line in, one response line out, connection closed. Requests
//! accept `cmd`/`command` and `args`/`data` interchangeably so older client
//! builds keep working.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single command sent to a registered app
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    #[serde(alias = "command")]
    pub cmd: String,
    #[serde(default, alias = "data")]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Pending,
}

/// Response to one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            data: None,
        }
    }

    pub fn success_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Pending,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_both_key_spellings() {
        let a: CommandRequest =
            serde_json::from_str(r#"{"cmd":"ping","args":{"x":1}}"#).unwrap();
        let b: CommandRequest =
            serde_json::from_str(r#"{"command":"ping","data":{"x":1}}"#).unwrap();

        assert_eq!(a.cmd, "ping");
        assert_eq!(b.cmd, "ping");
        assert_eq!(a.args["x"], json!(1));
        assert_eq!(b.args["x"], json!(1));
    }

    #[test]
    fn test_request_args_default_to_empty() {
        let req: CommandRequest = serde_json::from_str(r#"{"cmd":"status"}"#).unwrap();
        assert!(req.args.is_empty());
    }

    #[test]
    fn test_response_serialization() {
        let resp = CommandResponse::success_with_data("ok", json!({"port": 9001}));
        let text = serde_json::to_string(&resp).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["status"], json!("success"));
        assert_eq!(value["data"]["port"], json!(9001));

        let err = CommandResponse::error("nope");
        let text = serde_json::to_string(&err).unwrap();
        assert!(!text.contains("data"));
    }
}
