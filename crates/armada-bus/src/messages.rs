//! Wire format for agent RPC.
//!
//! Requests: `{method, arguments, reply_to}` published to
//! `agent.<agent_id>`. Replies: `{value}` on success or
//! `{exception: {message}}` on failure, published to the request's
//! `reply_to` inbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subject an agent listens on.
pub fn agent_subject(agent_id: &str) -> String {
    format!("agent.{agent_id}")
}

/// Per-invocation reply inbox.
pub fn inbox_subject(correlation: &str) -> String {
    format!("director.{correlation}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub method: String,
    pub arguments: Vec<Value>,
    pub reply_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<AgentException>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentException {
    pub message: String,
}

impl AgentReply {
    pub fn ok(value: Value) -> Self {
        Self {
            value: Some(value),
            exception: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: None,
            exception: Some(AgentException {
                message: message.into(),
            }),
        }
    }
}

/// Handle returned by long-running agent operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskRef {
    pub agent_task_id: String,
    pub state: String,
}

impl AgentTaskRef {
    /// Interpret a reply value as a task handle, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subjects() {
        assert_eq!(agent_subject("a-1"), "agent.a-1");
        assert_eq!(inbox_subject("c-9"), "director.c-9");
    }

    #[test]
    fn reply_serializes_only_present_half() {
        let ok = serde_json::to_value(AgentReply::ok(json!("pong"))).unwrap();
        assert_eq!(ok, json!({"value": "pong"}));

        let err = serde_json::to_value(AgentReply::error("no such disk")).unwrap();
        assert_eq!(err, json!({"exception": {"message": "no such disk"}}));
    }

    #[test]
    fn task_ref_detection() {
        let running = json!({"agent_task_id": "t-1", "state": "running"});
        let handle = AgentTaskRef::from_value(&running).unwrap();
        assert!(handle.is_running());

        assert!(AgentTaskRef::from_value(&json!({"result": "x"})).is_none());
        assert!(AgentTaskRef::from_value(&json!("pong")).is_none());
    }
}
