//! Template rendering for role system prompts and task prompts.

use minijinja::Environment;
use serde::Serialize;

use crate::error::Result;
use crate::types::{Agent, AgentRole, Rig};

const POLECAT_TEMPLATE: &str = include_str!("templates/polecat.md.jinja");
const REFINERY_TEMPLATE: &str = include_str!("templates/refinery.md.jinja");
const MAYOR_TEMPLATE: &str = include_str!("templates/mayor.md.jinja");
const WITNESS_TEMPLATE: &str = include_str!("templates/witness.md.jinja");
const TASK_TEMPLATE: &str = include_str!("templates/task.md.jinja");

/// Context data passed to role templates
#[derive(Debug, Serialize)]
pub struct PromptContext<'a> {
    pub agent: &'a Agent,
    pub rig: Option<&'a Rig>,
    pub town_id: &'a str,
    /// Orchestrator callback URL the agent reports to
    pub api_url: &'a str,
    /// Working branch, or the branch under review for the refinery
    pub branch: &'a str,
    pub quality_gates: &'a [String],
}

#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    title: &'a str,
    body: Option<&'a str>,
    checkpoint: Option<String>,
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("polecat", POLECAT_TEMPLATE)?;
    env.add_template("refinery", REFINERY_TEMPLATE)?;
    env.add_template("mayor", MAYOR_TEMPLATE)?;
    env.add_template("witness", WITNESS_TEMPLATE)?;
    env.add_template("task", TASK_TEMPLATE)?;
    Ok(env)
}

/// Render the system prompt for an agent's role
pub fn render_system_prompt(role: AgentRole, ctx: &PromptContext<'_>) -> Result<String> {
    let env = environment()?;
    let template = env.get_template(role.as_str())?;
    Ok(template.render(ctx)?)
}

/// Render the opening user prompt for a bead, resuming from a checkpoint if present
pub fn render_task_prompt(
    title: &str,
    body: Option<&str>,
    checkpoint: Option<&serde_json::Value>,
) -> Result<String> {
    let checkpoint = checkpoint
        .filter(|cp| !cp.is_null())
        .map(serde_json::to_string_pretty)
        .transpose()?;
    let env = environment()?;
    let template = env.get_template("task")?;
    Ok(template.render(TaskContext {
        title,
        body: body.filter(|b| !b.trim().is_empty()),
        checkpoint,
    })?)
}
