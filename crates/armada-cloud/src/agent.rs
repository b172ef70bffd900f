//! In-process agent for the dummy cloud.
//!
//! Each VM the dummy cloud creates gets one of these listening on
//! `agent.<agent_id>`. It answers the full RPC method set the director
//! consumes, tracks applied state and mounted disks, and supports failure
//! injection for exercising unwind paths.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use armada_bus::{agent_subject, AgentReply, AgentRequest, Bus};
use armada_core::hex_digest;

/// Failure injection knobs.
#[derive(Debug, Clone, Default)]
pub struct DummyAgentBehavior {
    /// Fail `compile_package` for this package name.
    pub compile_failure: Option<String>,
    /// Fail `migrate_disk`.
    pub fail_migrate_disk: bool,
    /// Job state reported after `start` (default `running`).
    pub job_state_after_start: Option<String>,
}

/// Mutable per-agent state, single-threaded inside the agent task.
struct AgentState {
    applied: Value,
    job_state: String,
    mounted: Vec<String>,
    tasks: HashMap<String, Value>,
}

pub struct DummyAgent;

impl DummyAgent {
    /// Run an agent on the bus until the returned handle is aborted.
    pub fn spawn(
        bus: Arc<dyn Bus>,
        agent_id: String,
        behavior: DummyAgentBehavior,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let subject = agent_subject(&agent_id);
            let mut sub = match bus.subscribe(&subject).await {
                Ok(sub) => sub,
                Err(_) => return,
            };
            let mut state = AgentState {
                applied: Value::Null,
                job_state: "stopped".to_string(),
                mounted: Vec::new(),
                tasks: HashMap::new(),
            };
            debug!(%agent_id, "dummy agent listening");

            while let Some(bytes) = sub.recv().await {
                let request: AgentRequest = match serde_json::from_slice(&bytes) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let reply = handle(&behavior, &mut state, &request);
                if let Ok(payload) = serde_json::to_vec(&reply) {
                    let _ = bus.publish(&request.reply_to, payload).await;
                }
            }
        })
    }
}

fn handle(
    behavior: &DummyAgentBehavior,
    state: &mut AgentState,
    request: &AgentRequest,
) -> AgentReply {
    let args = &request.arguments;
    match request.method.as_str() {
        "ping" => AgentReply::ok(json!("pong")),

        "apply" => {
            state.applied = args.first().cloned().unwrap_or(Value::Null);
            AgentReply::ok(json!("applied"))
        }

        "start" => {
            state.job_state = behavior
                .job_state_after_start
                .clone()
                .unwrap_or_else(|| "running".to_string());
            AgentReply::ok(json!("started"))
        }

        "stop" => {
            state.job_state = "stopped".to_string();
            AgentReply::ok(json!("stopped"))
        }

        "get_state" => AgentReply::ok(json!({
            "job_state": state.job_state,
            "applied_spec": state.applied,
        })),

        "get_task" => {
            let id = args.first().and_then(Value::as_str).unwrap_or_default();
            match state.tasks.get(id) {
                Some(value) => AgentReply::ok(json!({
                    "agent_task_id": id,
                    "state": "done",
                    "value": value,
                })),
                None => AgentReply::error(format!("unknown agent task: {id}")),
            }
        }

        "compile_package" => {
            // arguments: [blob_id, digest, name, version, deps]
            let name = args.get(2).and_then(Value::as_str).unwrap_or_default();
            if behavior.compile_failure.as_deref() == Some(name) {
                return AgentReply::error(format!("compilation of {name} exited 1"));
            }
            let compiled_blob = format!("compiled-{}", Uuid::new_v4());
            let digest = hex_digest(compiled_blob.as_bytes());
            let task_id = format!("at-{}", state.tasks.len() + 1);
            state.tasks.insert(
                task_id.clone(),
                json!({"result": {"blob_id": compiled_blob, "digest": digest}}),
            );
            AgentReply::ok(json!({"agent_task_id": task_id, "state": "running"}))
        }

        "migrate_disk" => {
            if behavior.fail_migrate_disk {
                AgentReply::error("disk migration exited 1")
            } else {
                AgentReply::ok(json!("migrated"))
            }
        }

        "mount_disk" => {
            if let Some(cid) = args.first().and_then(Value::as_str) {
                if !state.mounted.iter().any(|c| c == cid) {
                    state.mounted.push(cid.to_string());
                }
            }
            AgentReply::ok(json!("mounted"))
        }

        "unmount_disk" => {
            if let Some(cid) = args.first().and_then(Value::as_str) {
                state.mounted.retain(|c| c != cid);
            }
            AgentReply::ok(json!("unmounted"))
        }

        "list_disk" => AgentReply::ok(json!(state.mounted)),

        other => AgentReply::error(format!("unknown method: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_bus::{AgentClient, MemoryBus};
    use serde_json::json;

    fn client_and_agent(behavior: DummyAgentBehavior) -> (AgentClient, JoinHandle<()>) {
        let bus = Arc::new(MemoryBus::new());
        let handle = DummyAgent::spawn(Arc::clone(&bus) as Arc<dyn Bus>, "a-1".into(), behavior);
        (AgentClient::new(bus), handle)
    }

    #[tokio::test]
    async fn lifecycle_methods() {
        let (client, _agent) = client_and_agent(DummyAgentBehavior::default());

        assert_eq!(client.call("a-1", "ping", vec![]).await.unwrap(), json!("pong"));

        let spec = json!({"deployment": "prod", "job": {"name": "web"}, "index": 0});
        client.call("a-1", "apply", vec![spec.clone()]).await.unwrap();
        client.call("a-1", "start", vec![]).await.unwrap();

        let state = client.call("a-1", "get_state", vec![]).await.unwrap();
        assert_eq!(state["job_state"], "running");
        assert_eq!(state["applied_spec"], spec);

        client.call("a-1", "stop", vec![]).await.unwrap();
        let state = client.call("a-1", "get_state", vec![]).await.unwrap();
        assert_eq!(state["job_state"], "stopped");
    }

    #[tokio::test]
    async fn compile_package_returns_task_handle() {
        let (client, _agent) = client_and_agent(DummyAgentBehavior::default());

        let handle = client
            .call(
                "a-1",
                "compile_package",
                vec![json!("blob-src"), json!("d"), json!("redis"), json!("7"), json!({})],
            )
            .await
            .unwrap();
        assert_eq!(handle["state"], "running");

        let result = client
            .wait_task("a-1", handle["agent_task_id"].as_str().unwrap())
            .await
            .unwrap();
        assert!(result["result"]["blob_id"]
            .as_str()
            .unwrap()
            .starts_with("compiled-"));
    }

    #[tokio::test]
    async fn compile_failure_injection() {
        let (client, _agent) = client_and_agent(DummyAgentBehavior {
            compile_failure: Some("redis".into()),
            ..Default::default()
        });

        let err = client
            .call(
                "a-1",
                "compile_package",
                vec![json!("b"), json!("d"), json!("redis"), json!("7"), json!({})],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("compilation of redis"));
    }

    #[tokio::test]
    async fn disk_mount_bookkeeping() {
        let (client, _agent) = client_and_agent(DummyAgentBehavior::default());

        client.call("a-1", "mount_disk", vec![json!("disk-1")]).await.unwrap();
        client.call("a-1", "mount_disk", vec![json!("disk-2")]).await.unwrap();
        assert_eq!(
            client.call("a-1", "list_disk", vec![]).await.unwrap(),
            json!(["disk-1", "disk-2"])
        );

        client.call("a-1", "unmount_disk", vec![json!("disk-1")]).await.unwrap();
        assert_eq!(
            client.call("a-1", "list_disk", vec![]).await.unwrap(),
            json!(["disk-2"])
        );
    }

    #[tokio::test]
    async fn migrate_disk_failure_injection() {
        let (client, _agent) = client_and_agent(DummyAgentBehavior {
            fail_migrate_disk: true,
            ..Default::default()
        });

        let err = client
            .call("a-1", "migrate_disk", vec![json!("old"), json!("new")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("migration"));
    }
}
