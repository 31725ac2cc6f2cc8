//! HTTP client for the container runtime.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{ContainerRuntime, ContainerStatus, MergeRequest, StartAgentRequest};
use crate::config::RuntimeSettings;
use crate::types::ReviewOutcome;

pub struct HttpRuntime {
    base_url: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    exit_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeResponse {
    success: bool,
    #[serde(default)]
    commit_sha: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Failure talking to the runtime. Never escapes this module.
#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error("transport: {0}")]
    Transport(#[from] ureq::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HttpRuntime {
    pub fn new(settings: &RuntimeSettings) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout()))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn bearer(&self) -> Option<String> {
        self.api_key.as_ref().map(|key| format!("Bearer {key}"))
    }

    fn get_raw(&self, path: &str) -> Result<(u16, String), CallError> {
        let mut request = self.agent.get(self.url(path));
        if let Some(auth) = self.bearer() {
            request = request.header("authorization", auth);
        }
        let mut response = request.call()?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        Ok((status, body))
    }

    fn post_raw(&self, path: &str, body: &str) -> Result<(u16, String), CallError> {
        let mut request = self
            .agent
            .post(self.url(path))
            .header("content-type", "application/json");
        if let Some(auth) = self.bearer() {
            request = request.header("authorization", auth);
        }
        let mut response = request.send(body)?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        Ok((status, body))
    }

    fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<String, CallError> {
        let payload = serde_json::to_string(body)?;
        let (status, text) = self.post_raw(path, &payload)?;
        if (200..300).contains(&status) {
            Ok(text)
        } else {
            debug!(path, status, body = %text, "runtime rejected request");
            Err(CallError::Status(status))
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<(u16, Option<T>), CallError> {
        let (status, text) = self.get_raw(path)?;
        if (200..300).contains(&status) {
            Ok((status, Some(serde_json::from_str(&text)?)))
        } else {
            Ok((status, None))
        }
    }
}

impl ContainerRuntime for HttpRuntime {
    fn start_agent(&self, request: &StartAgentRequest) -> bool {
        match self.post_json("/agents/start", request) {
            Ok(_) => true,
            Err(e) => {
                warn!(agent_id = %request.agent_id, error = %e, "container start failed");
                false
            }
        }
    }

    fn agent_status(&self, agent_id: &str) -> ContainerStatus {
        match self.get_json::<StatusResponse>(&format!("/agents/{agent_id}/status")) {
            Ok((404, _)) => ContainerStatus::Gone { reason: None },
            Ok((_, Some(body))) => match body.status.as_str() {
                "running" | "starting" => ContainerStatus::Running,
                "exited" | "stopped" | "not_found" => ContainerStatus::Gone {
                    reason: body.exit_reason,
                },
                other => {
                    debug!(agent_id, status = other, "unrecognized container status");
                    ContainerStatus::Unknown
                }
            },
            Ok((status, None)) => {
                warn!(agent_id, status, "status poll rejected");
                ContainerStatus::Unknown
            }
            Err(e) => {
                warn!(agent_id, error = %e, "status poll failed");
                ContainerStatus::Unknown
            }
        }
    }

    fn stop_agent(&self, agent_id: &str) {
        if let Err(e) = self.post_json(&format!("/agents/{agent_id}/stop"), &serde_json::json!({})) {
            warn!(agent_id, error = %e, "container stop failed");
        }
    }

    fn send_message(&self, agent_id: &str, message: &str) -> bool {
        let body = serde_json::json!({ "prompt": message });
        match self.post_json(&format!("/agents/{agent_id}/message"), &body) {
            Ok(_) => true,
            Err(e) => {
                warn!(agent_id, error = %e, "message delivery failed");
                false
            }
        }
    }

    fn merge(&self, request: &MergeRequest) -> ReviewOutcome {
        let parsed = self
            .post_json("/git/merge", request)
            .and_then(|text| Ok(serde_json::from_str::<MergeResponse>(&text)?));
        match parsed {
            Ok(MergeResponse {
                success: true,
                commit_sha,
                ..
            }) => ReviewOutcome::Merged { commit_sha },
            Ok(MergeResponse { error, .. }) => ReviewOutcome::Failed {
                error: error.unwrap_or_else(|| "merge rejected".to_string()),
            },
            Err(e) => {
                warn!(bead_id = %request.bead_id, branch = %request.branch, error = %e, "merge call failed");
                ReviewOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn health(&self) -> bool {
        matches!(self.get_raw("/health"), Ok((status, _)) if (200..300).contains(&status))
    }
}
