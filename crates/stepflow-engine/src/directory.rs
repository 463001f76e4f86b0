use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, warn};

use stepflow_core::config::AgentEndpoint;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{AgentDirectory, AgentInput, AgentResponse};

/// Agent directory backed by HTTP endpoints from `[agents.<ref>]` config.
///
/// Each invocation POSTs the step input as JSON and expects an
/// `AgentResponse` body (`{"status": "success", "output": ..., "elapsedMs": ...}`).
pub struct HttpAgentDirectory {
    http: Client,
    agents: BTreeMap<String, AgentEndpoint>,
}

impl HttpAgentDirectory {
    pub fn new(agents: BTreeMap<String, AgentEndpoint>) -> Self {
        Self {
            http: Client::new(),
            agents,
        }
    }

    fn endpoint(&self, agent_ref: &str) -> Result<&AgentEndpoint> {
        self.agents
            .get(agent_ref)
            .ok_or_else(|| StepflowError::AgentInvocation {
                agent: agent_ref.to_string(),
                message: "agent is not configured".to_string(),
            })
    }
}

impl AgentDirectory for HttpAgentDirectory {
    fn invoke(&self, agent_ref: &str, input: AgentInput) -> BoxFuture<'_, Result<AgentResponse>> {
        let agent = agent_ref.to_string();
        Box::pin(async move {
            let endpoint = self.endpoint(&agent)?;
            let invocation_error = |message: String| StepflowError::AgentInvocation {
                agent: agent.clone(),
                message,
            };

            debug!(agent = %agent, url = %endpoint.url, step_id = %input.step_id, "POST agent invocation");
            let mut request = self.http.post(&endpoint.url).json(&input);
            if let Some(secs) = endpoint.timeout_secs {
                request = request.timeout(Duration::from_secs(secs));
            }
            if let Some(ref key) = endpoint.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| invocation_error(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(agent = %agent, %status, "Agent returned an error status");
                return Err(invocation_error(format!("HTTP {}: {}", status, body)));
            }

            response
                .json::<AgentResponse>()
                .await
                .map_err(|e| invocation_error(format!("malformed response: {}", e)))
        })
    }

    fn resolve_capabilities(&self, agent_ref: &str) -> BoxFuture<'_, Result<BTreeSet<String>>> {
        let result = self
            .endpoint(agent_ref)
            .map(|endpoint| endpoint.capabilities.iter().cloned().collect());
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use stepflow_core::types::{ExecutionId, StepId, WorkflowId};

    fn endpoint(url: &str, caps: &[&str]) -> AgentEndpoint {
        AgentEndpoint {
            url: url.to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            timeout_secs: Some(1),
            api_key: None,
        }
    }

    /// A listener that accepts connections and never answers.
    async fn silent_agent() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/invoke", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (url, task)
    }

    fn input() -> AgentInput {
        AgentInput {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::from("wf"),
            step_id: StepId::from("a"),
            role: "Analyst".into(),
            task: String::new(),
            engines: BTreeSet::new(),
            input: serde_json::Value::Null,
            upstream: Map::new(),
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn capabilities_come_from_config() {
        let dir = HttpAgentDirectory::new(Map::from([(
            "scorer".to_string(),
            endpoint("http://127.0.0.1:9/score", &["gpt", "search"]),
        )]));
        let caps = dir.resolve_capabilities("scorer").await.unwrap();
        assert_eq!(caps, BTreeSet::from(["gpt".to_string(), "search".to_string()]));
        assert!(dir.resolve_capabilities("missing").await.is_err());
    }

    #[tokio::test]
    async fn unknown_agent_is_an_invocation_error() {
        let dir = HttpAgentDirectory::new(Map::new());
        let err = dir.invoke("ghost", input()).await.unwrap_err();
        assert!(matches!(err, StepflowError::AgentInvocation { ref agent, .. } if agent == "ghost"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_invocation_error() {
        let dir = HttpAgentDirectory::new(Map::from([(
            "scorer".to_string(),
            endpoint("http://127.0.0.1:9/score", &[]),
        )]));
        let err = dir.invoke("scorer", input()).await.unwrap_err();
        assert!(matches!(err, StepflowError::AgentInvocation { .. }));
    }

    #[tokio::test]
    async fn request_timeout_applies_only_when_configured() {
        let (url, server) = silent_agent().await;

        let bounded = HttpAgentDirectory::new(Map::from([(
            "slow".to_string(),
            endpoint(&url, &[]),
        )]));
        let err = tokio::time::timeout(Duration::from_secs(5), bounded.invoke("slow", input()))
            .await
            .expect("configured timeout should end the request")
            .unwrap_err();
        assert!(matches!(err, StepflowError::AgentInvocation { .. }));

        let mut open = endpoint(&url, &[]);
        open.timeout_secs = None;
        let unbounded = HttpAgentDirectory::new(Map::from([("slow".to_string(), open)]));
        let outcome =
            tokio::time::timeout(Duration::from_millis(1500), unbounded.invoke("slow", input())).await;
        assert!(outcome.is_err(), "request should wait for the step timeout");

        server.abort();
    }
}
