use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::Result;
use crate::template::{self, PromptContext};
use crate::types::AgentRole;

fn re_non_slug() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern compiles"))
}

/// Lowercase `[a-z0-9-]` form of `input`, with runs of other characters
/// collapsed to one `-` and no leading or trailing `-`.
pub fn slug(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    re_non_slug()
        .replace_all(&lower, "-")
        .trim_matches('-')
        .to_string()
}

/// Working branch for an agent on a bead: `town/<agent>/<bead prefix>`.
pub fn branch_for_agent(agent_name: &str, bead_id: &str) -> String {
    let name = match slug(agent_name) {
        s if s.is_empty() => "agent".to_string(),
        s => s,
    };
    let short: String = slug(bead_id).chars().filter(|c| *c != '-').take(8).collect();
    format!("town/{name}/{short}")
}

pub fn build_prompt(title: &str, body: Option<&str>, checkpoint: Option<&Value>) -> Result<String> {
    template::render_task_prompt(title, body, checkpoint)
}

pub fn system_prompt_for_role(role: AgentRole, ctx: &PromptContext<'_>) -> Result<String> {
    template::render_system_prompt(role, ctx)
}
