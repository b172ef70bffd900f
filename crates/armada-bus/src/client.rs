//! Agent RPC client.
//!
//! One subscription per in-flight call, matched by correlation id only, so
//! concurrent calls to the same agent are fine. Retries apply to timeouts
//! of idempotent methods only.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use armada_core::{DirectorError, DirectorResult};

use crate::bus::Bus;
use crate::messages::{agent_subject, inbox_subject, AgentReply, AgentRequest, AgentTaskRef};

/// Methods safe to re-send after a timeout.
const IDEMPOTENT: &[&str] = &["ping", "get_state", "get_task"];

#[derive(Clone)]
pub struct AgentClient {
    bus: Arc<dyn Bus>,
    timeout: Duration,
    retries: u32,
}

impl AgentClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Call with the default deadline.
    pub async fn call(
        &self,
        agent_id: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> DirectorResult<Value> {
        self.call_opt(agent_id, method, arguments, Some(self.timeout))
            .await
    }

    /// Call with an explicit deadline; `None` waits indefinitely (used for
    /// agent-side long operations where the agent's heartbeat is the
    /// liveness contract).
    pub async fn call_opt(
        &self,
        agent_id: &str,
        method: &str,
        arguments: Vec<Value>,
        deadline: Option<Duration>,
    ) -> DirectorResult<Value> {
        let attempts = if IDEMPOTENT.contains(&method) {
            1 + self.retries
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .call_once(agent_id, method, arguments.clone(), deadline)
                .await
            {
                Err(DirectorError::AgentTimeout { .. }) if attempt < attempts => {
                    warn!(%agent_id, method, attempt, "agent call timed out, retrying");
                }
                other => return other,
            }
        }
    }

    async fn call_once(
        &self,
        agent_id: &str,
        method: &str,
        arguments: Vec<Value>,
        deadline: Option<Duration>,
    ) -> DirectorResult<Value> {
        let correlation = Uuid::new_v4().to_string();
        let inbox = inbox_subject(&correlation);

        // Subscribe before publishing so the reply cannot race the inbox.
        let mut sub = self
            .bus
            .subscribe(&inbox)
            .await
            .map_err(|e| DirectorError::AgentUnreachable(format!("{agent_id}: {e}")))?;

        let request = AgentRequest {
            method: method.to_string(),
            arguments,
            reply_to: inbox.clone(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| DirectorError::AgentUnreachable(format!("{agent_id}: {e}")))?;
        self.bus
            .publish(&agent_subject(agent_id), payload)
            .await
            .map_err(|e| DirectorError::AgentUnreachable(format!("{agent_id}: {e}")))?;
        debug!(%agent_id, method, %correlation, "agent request published");

        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, sub.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    return Err(DirectorError::AgentTimeout {
                        agent_id: agent_id.to_string(),
                        method: method.to_string(),
                    })
                }
            },
            None => sub.recv().await,
        };
        // The subscription drops here, releasing the inbox.

        let bytes = received
            .ok_or_else(|| DirectorError::AgentUnreachable(agent_id.to_string()))?;
        let reply: AgentReply = serde_json::from_slice(&bytes).map_err(|e| {
            DirectorError::RemoteError {
                agent_id: agent_id.to_string(),
                message: format!("unparseable reply: {e}"),
            }
        })?;

        if let Some(exception) = reply.exception {
            return Err(DirectorError::RemoteError {
                agent_id: agent_id.to_string(),
                message: exception.message,
            });
        }
        Ok(reply.value.unwrap_or(Value::Null))
    }

    /// Poll `get_task` until the agent-side task leaves `running`, backing
    /// off exponentially from one second up to a five second cap. Returns
    /// the final value; remote errors surface as `RemoteError`.
    pub async fn wait_task(&self, agent_id: &str, agent_task_id: &str) -> DirectorResult<Value> {
        let mut backoff = Duration::from_secs(1);
        loop {
            let value = self
                .call(agent_id, "get_task", vec![Value::String(agent_task_id.into())])
                .await?;

            match AgentTaskRef::from_value(&value) {
                Some(handle) if handle.is_running() => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                _ => {
                    // Finished: the agent reports the final value, either
                    // wrapped in `{value: ...}` task state or directly.
                    let result = value
                        .as_object()
                        .and_then(|o| o.get("value").cloned())
                        .unwrap_or(value);
                    return Ok(result);
                }
            }
        }
    }

    /// Ping the agent until it answers or the deadline passes.
    pub async fn ping_within(&self, agent_id: &str, deadline: Duration) -> DirectorResult<()> {
        let started = Instant::now();
        loop {
            match self
                .call_opt(agent_id, "ping", vec![], Some(Duration::from_secs(2)))
                .await
            {
                Ok(_) => return Ok(()),
                Err(DirectorError::AgentTimeout { .. })
                | Err(DirectorError::AgentUnreachable(_)) => {
                    if started.elapsed() >= deadline {
                        return Err(DirectorError::AgentUnreachable(agent_id.to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use serde_json::json;

    /// Run a one-shot responder for an agent subject.
    fn respond(bus: Arc<MemoryBus>, agent_id: &str, reply_fn: impl Fn(AgentRequest) -> AgentReply + Send + 'static) {
        let subject = agent_subject(agent_id);
        tokio::spawn(async move {
            let mut sub = bus.subscribe(&subject).await.unwrap();
            while let Some(bytes) = sub.recv().await {
                let request: AgentRequest = serde_json::from_slice(&bytes).unwrap();
                let reply_to = request.reply_to.clone();
                let reply = reply_fn(request);
                bus.publish(&reply_to, serde_json::to_vec(&reply).unwrap())
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn call_roundtrip() {
        let bus = Arc::new(MemoryBus::new());
        respond(Arc::clone(&bus), "agent-1", |req| {
            assert_eq!(req.method, "ping");
            AgentReply::ok(json!("pong"))
        });

        let client = AgentClient::new(bus);
        let value = client.call("agent-1", "ping", vec![]).await.unwrap();
        assert_eq!(value, json!("pong"));
    }

    #[tokio::test]
    async fn remote_exception_surfaces_verbatim() {
        let bus = Arc::new(MemoryBus::new());
        respond(Arc::clone(&bus), "agent-1", |_| {
            AgentReply::error("disk not mounted")
        });

        let client = AgentClient::new(bus);
        let err = client
            .call("agent-1", "stop", vec![])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DirectorError::RemoteError {
                agent_id: "agent-1".into(),
                message: "disk not mounted".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out() {
        let bus = Arc::new(MemoryBus::new());
        let client = AgentClient::new(bus).with_timeout(Duration::from_secs(30));

        // `stop` is not idempotent, so a single timeout surfaces.
        let err = client.call("agent-gone", "stop", vec![]).await.unwrap_err();
        assert_eq!(
            err,
            DirectorError::AgentTimeout {
                agent_id: "agent-gone".into(),
                method: "stop".into(),
            }
        );
    }

    #[tokio::test]
    async fn concurrent_calls_are_matched_by_correlation() {
        let bus = Arc::new(MemoryBus::new());
        respond(Arc::clone(&bus), "agent-1", |req| {
            // Echo the first argument back.
            AgentReply::ok(req.arguments[0].clone())
        });

        let client = AgentClient::new(bus);
        let a = client.call("agent-1", "get_state", vec![json!("a")]);
        let b = client.call("agent-1", "get_state", vec![json!("b")]);
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap(), json!("a"));
        assert_eq!(rb.unwrap(), json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_task_polls_until_done() {
        let bus = Arc::new(MemoryBus::new());
        let polls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let polls_inner = Arc::clone(&polls);
        respond(Arc::clone(&bus), "agent-1", move |req| {
            assert_eq!(req.method, "get_task");
            let n = polls_inner.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 3 {
                AgentReply::ok(json!({"agent_task_id": "t-1", "state": "running"}))
            } else {
                AgentReply::ok(json!({
                    "agent_task_id": "t-1",
                    "state": "done",
                    "value": {"result": {"blob_id": "b-1", "digest": "d"}}
                }))
            }
        });

        let client = AgentClient::new(bus);
        let value = client.wait_task("agent-1", "t-1").await.unwrap();
        assert_eq!(value["result"]["blob_id"], "b-1");
        assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_within_gives_up_on_silence() {
        let bus = Arc::new(MemoryBus::new());
        let client = AgentClient::new(bus);

        let err = client
            .ping_within("agent-gone", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, DirectorError::AgentUnreachable("agent-gone".into()));
    }
}
