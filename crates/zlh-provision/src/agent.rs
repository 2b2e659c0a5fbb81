//! Guest agent control protocol: `POST /config` once, then poll `GET /status`
//! until the guest reports `running` or a failure state.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::time::Instant;
use zlh_model::AgentState;

use crate::config::AgentSettings;
use crate::error::{ProvisionError, Result};

#[derive(Debug, thiserror::Error)]
pub enum AgentCallError {
    #[error("{op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op}: HTTP {status}: {body}")]
    Http {
        op: &'static str,
        status: u16,
        body: String,
    },
}

impl AgentCallError {
    /// Expected while the guest is still booting.
    pub fn is_connection_refused(&self) -> bool {
        match self {
            AgentCallError::Transport { source, .. } => source.is_connect(),
            AgentCallError::Http { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub state: AgentState,
    pub error: Option<String>,
}

impl AgentStatus {
    /// `{state}` or legacy `{status}`, plus optional `error`.
    pub fn from_json(v: &Value) -> Self {
        let state = v
            .get("state")
            .or_else(|| v.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        AgentStatus {
            state: AgentState::parse(state),
            error: v
                .get("error")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

#[async_trait::async_trait]
pub trait GuestAgent: Send + Sync {
    async fn push_config(&self, address: &str, payload: &Value) -> std::result::Result<(), AgentCallError>;
    async fn status(&self, address: &str) -> std::result::Result<AgentStatus, AgentCallError>;
}

pub struct HttpGuestAgent {
    http: reqwest::Client,
    port: u16,
    token: Option<String>,
}

impl HttpGuestAgent {
    pub fn new(settings: &AgentSettings) -> std::result::Result<Self, AgentCallError> {
        let http = reqwest::Client::builder()
            .user_agent("zlh-control")
            .timeout(settings.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|source| AgentCallError::Transport {
                op: "client",
                source,
            })?;
        Ok(Self {
            http,
            port: settings.port,
            token: settings.token.clone(),
        })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{address}:{}{path}", self.port)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl GuestAgent for HttpGuestAgent {
    async fn push_config(&self, address: &str, payload: &Value) -> std::result::Result<(), AgentCallError> {
        let op = "agent /config";
        let resp = self
            .auth(self.http.post(self.url(address, "/config")).json(payload))
            .send()
            .await
            .map_err(|source| AgentCallError::Transport { op, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentCallError::Http {
                op,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn status(&self, address: &str) -> std::result::Result<AgentStatus, AgentCallError> {
        let op = "agent /status";
        let resp = self
            .auth(self.http.get(self.url(address, "/status")))
            .send()
            .await
            .map_err(|source| AgentCallError::Transport { op, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentCallError::Http {
                op,
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(AgentStatus::from_json(&body))
    }
}

/// Protocol semantics on top of a [`GuestAgent`] transport.
#[derive(Clone)]
pub struct AgentClient {
    agent: Arc<dyn GuestAgent>,
    status_interval: Duration,
    ready_timeout: Duration,
}

impl AgentClient {
    pub fn new(agent: Arc<dyn GuestAgent>, settings: &AgentSettings) -> Self {
        Self {
            agent,
            status_interval: settings.status_interval,
            ready_timeout: settings.ready_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn GuestAgent> {
        &self.agent
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Exactly one attempt. A guest mid-install must not see a second config.
    pub async fn push_config(&self, address: &str, payload: &Value) -> Result<()> {
        match self.agent.push_config(address, payload).await {
            Ok(()) => Ok(()),
            Err(AgentCallError::Http { status, body, .. }) => {
                Err(ProvisionError::AgentConfigRejected { status, body })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn await_running(&self, address: &str, timeout: Duration) -> Result<AgentStatus> {
        let deadline = Instant::now() + timeout;
        let mut last = String::from("no status received");
        loop {
            match self.agent.status(address).await {
                Ok(st) if st.state == AgentState::Running => return Ok(st),
                Ok(st) if st.state.is_failure() => {
                    return Err(ProvisionError::AgentError {
                        state: st.state.as_str().to_string(),
                        message: st.error,
                    });
                }
                Ok(st) => {
                    tracing::debug!(address, state = st.state.as_str(), "agent not ready");
                    last = format!("agent state={}", st.state.as_str());
                }
                Err(e) if e.is_connection_refused() => {
                    tracing::debug!(address, "agent not listening yet");
                    last = e.to_string();
                }
                Err(e) => {
                    tracing::info!(address, error = %e, "agent status poll failed; retrying");
                    last = e.to_string();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::AgentTimeout { last });
            }
            tokio::time::sleep(self.status_interval.min(deadline - now)).await;
        }
    }
}
