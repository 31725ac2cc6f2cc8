//! The container runtime seam.
//!
//! Everything that leaves the process for the container runtime goes through
//! [`ContainerRuntime`]. Implementations swallow transport failures: callers
//! see `false`, [`ContainerStatus::Unknown`], or a failed merge, never an error.

mod client;
mod prompt;
pub mod testing;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AgentRole, ReviewOutcome};

pub use client::HttpRuntime;
pub use prompt::{branch_for_agent, build_prompt, slug, system_prompt_for_role};

/// Body of `POST /agents/start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAgentRequest {
    pub agent_id: String,
    pub town_id: String,
    pub rig_id: String,
    pub role: AgentRole,
    pub name: String,
    pub identity: String,
    pub git_url: String,
    pub default_branch: String,
    pub branch: String,
    pub model: String,
    pub system_prompt: String,
    pub prompt: String,
    pub env_vars: BTreeMap<String, String>,
}

/// Body of `POST /git/merge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub entry_id: String,
    pub agent_id: String,
    pub rig_id: String,
    pub bead_id: String,
    pub git_url: String,
    pub branch: String,
    pub target_branch: String,
    pub env_vars: BTreeMap<String, String>,
}

/// What the runtime knows about an agent's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    /// The process is gone; `reason` is `completed` for a clean finish.
    Gone { reason: Option<String> },
    /// The runtime could not be asked or gave an answer we do not understand.
    Unknown,
}

impl ContainerStatus {
    pub fn completed(&self) -> bool {
        matches!(self, Self::Gone { reason: Some(r) } if r == "completed")
    }
}

pub trait ContainerRuntime: Send + Sync {
    /// Returns whether the runtime accepted the start.
    fn start_agent(&self, request: &StartAgentRequest) -> bool;

    fn agent_status(&self, agent_id: &str) -> ContainerStatus;

    /// Best effort; failures are logged.
    fn stop_agent(&self, agent_id: &str);

    /// Returns whether the message was delivered to a running container.
    fn send_message(&self, agent_id: &str, message: &str) -> bool;

    fn merge(&self, request: &MergeRequest) -> ReviewOutcome;

    fn health(&self) -> bool;
}
