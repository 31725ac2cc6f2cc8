use std::collections::BTreeMap;

use tracing::warn;

use super::Town;
use crate::config::{RigConfig, TownConfig};
use crate::dispatch::{
    MergeRequest, StartAgentRequest, branch_for_agent, build_prompt, system_prompt_for_role,
};
use crate::error::{Result, TownError};
use crate::template::PromptContext;
use crate::token::{self, Subject};
use crate::types::{Agent, Bead, ReviewEntry, ReviewOutcome, Rig};

/// Merges env layers, later layers winning.
fn merged_env(
    town: &TownConfig,
    rig: Option<&RigConfig>,
    callback: &[(&str, String)],
) -> BTreeMap<String, String> {
    let mut env = town.env_vars.clone();
    if let Some(rig) = rig {
        env.extend(rig.env_vars.clone());
    }

    let git = &town.git;
    if let Some(token) = &git.github_token {
        env.insert("GITHUB_TOKEN".into(), token.clone());
    }
    if let Some(token) = &git.gitlab_token {
        env.insert("GITLAB_TOKEN".into(), token.clone());
    }
    if let Some(user) = &git.username {
        env.insert("GIT_USERNAME".into(), user.clone());
    }
    if let Some(rig) = rig {
        if let Some(token) = &rig.git_token {
            env.insert("GIT_TOKEN".into(), token.clone());
        }
        if let Some(user) = &rig.git_username {
            env.insert("GIT_USERNAME".into(), user.clone());
        }
    }

    if let Some(key) = &town.model_api_key {
        env.insert("TOWN_MODEL_API_KEY".into(), key.clone());
    }
    for (key, value) in callback {
        env.insert((*key).to_string(), value.clone());
    }
    env
}

/// What a container start is about.
#[derive(Debug, Clone, Copy)]
pub enum StartPrompt<'a> {
    /// Work on the agent's hooked bead.
    Bead(&'a Bead),
    /// Review a queued branch.
    Review(&'a ReviewEntry, &'a Bead),
    /// A free-form session, as when waking the mayor.
    Message(&'a str),
}

impl Town {
    /// The bead's rig wins over the agent's home rig.
    fn resolve_rig(&self, agent: &Agent, bead: Option<&Bead>) -> Result<Option<Rig>> {
        let rig_id = bead
            .and_then(|b| b.rig_id.as_deref())
            .or(agent.rig_id.as_deref());
        match rig_id {
            Some(id) => self.store.get_rig(id),
            None => Ok(None),
        }
    }

    /// Builds the start request for an agent. Pure preparation: nothing is sent.
    pub fn prepare_start(&self, agent: &Agent, what: StartPrompt<'_>) -> Result<StartAgentRequest> {
        let bead = match what {
            StartPrompt::Bead(bead) | StartPrompt::Review(_, bead) => Some(bead),
            StartPrompt::Message(_) => None,
        };
        let rig = self.resolve_rig(agent, bead)?;
        let rig_config = match &rig {
            Some(rig) => self.store.rig_config(&rig.id)?,
            None => None,
        };
        let town_config = self.store.town_config()?;

        let branch = match what {
            StartPrompt::Review(entry, _) => entry.branch.clone(),
            StartPrompt::Bead(bead) => branch_for_agent(&agent.name, &bead.id),
            StartPrompt::Message(_) => String::new(),
        };
        let prompt = match what {
            StartPrompt::Bead(bead) => build_prompt(
                &bead.title,
                bead.body.as_deref(),
                agent.checkpoint.as_ref(),
            )?,
            StartPrompt::Review(entry, bead) => {
                let mut text = build_prompt(&bead.title, bead.body.as_deref(), None)?;
                text.push_str(&format!("\nReview branch `{}`.", entry.branch));
                if let Some(summary) = &entry.summary {
                    text.push_str(&format!(" The author says: {summary}"));
                }
                text.push('\n');
                text
            }
            StartPrompt::Message(message) => message.to_string(),
        };
        let api_url = self.settings.auth.callback_url.clone();
        let system_prompt = system_prompt_for_role(
            agent.role,
            &PromptContext {
                agent,
                rig: rig.as_ref(),
                town_id: self.id(),
                api_url: &api_url,
                branch: &branch,
                quality_gates: &town_config.quality_gates,
            },
        )?;

        let rig_id = rig.as_ref().map(|r| r.id.clone()).unwrap_or_default();
        let now = self.now();
        let ttl = self.settings.auth.token_ttl();
        let session_token = token::mint(
            &self.settings.auth.secret()?,
            Subject {
                agent_id: &agent.id,
                rig_id: &rig_id,
                town_id: self.id(),
                user_id: self.owner_user_id(),
            },
            now,
            ttl,
        )?;

        let model_tier = rig_config
            .as_ref()
            .and_then(|c| c.model.clone())
            .unwrap_or_else(|| town_config.default_model.clone());
        let env_vars = merged_env(
            &town_config,
            rig_config.as_ref(),
            &[
                ("TOWN_API_URL", api_url),
                ("TOWN_SESSION_TOKEN", session_token),
                ("TOWN_AGENT_ID", agent.id.clone()),
                ("TOWN_RIG_ID", rig_id.clone()),
                ("TOWN_ID", self.id().to_string()),
            ],
        );

        Ok(StartAgentRequest {
            agent_id: agent.id.clone(),
            town_id: self.id().to_string(),
            rig_id,
            role: agent.role,
            name: agent.name.clone(),
            identity: agent.identity.clone(),
            git_url: rig.as_ref().map(|r| r.git_url.clone()).unwrap_or_default(),
            default_branch: rig
                .as_ref()
                .map_or_else(|| "main".to_string(), |r| r.default_branch.clone()),
            branch,
            model: self.settings.resolve_model(&model_tier),
            system_prompt,
            prompt,
            env_vars,
        })
    }

    /// Prepares and sends a start. Preparation failures count as a failed start.
    pub fn start_agent_in_container(&self, agent: &Agent, what: StartPrompt<'_>) -> bool {
        match self.prepare_start(agent, what) {
            Ok(request) => self.runtime.start_agent(&request),
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "could not prepare container start");
                false
            }
        }
    }

    pub fn prepare_merge(&self, entry: &ReviewEntry) -> Result<MergeRequest> {
        let bead = self
            .store
            .get_bead(&entry.bead_id)?
            .ok_or_else(|| TownError::not_found("bead", &entry.bead_id))?;
        let rig_id = bead.rig_id.clone().ok_or_else(|| {
            TownError::Invalid(format!("bead {} has no rig to merge into", bead.id))
        })?;
        let rig = self
            .store
            .get_rig(&rig_id)?
            .ok_or_else(|| TownError::not_found("rig", &rig_id))?;
        let rig_config = self.store.rig_config(&rig.id)?;
        let town_config = self.store.town_config()?;
        Ok(MergeRequest {
            entry_id: entry.id.clone(),
            agent_id: entry.agent_id.clone(),
            rig_id: rig.id.clone(),
            bead_id: bead.id.clone(),
            git_url: rig.git_url.clone(),
            branch: entry.branch.clone(),
            target_branch: rig.default_branch,
            env_vars: merged_env(&town_config, rig_config.as_ref(), &[]),
        })
    }

    /// Runs the deterministic merge for a review entry.
    pub fn start_merge_in_container(&self, entry: &ReviewEntry) -> ReviewOutcome {
        match self.prepare_merge(entry) {
            Ok(request) => self.runtime.merge(&request),
            Err(e) => ReviewOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitCredentials;
    use crate::town::test_support::{SECRET, harness};
    use crate::types::{AgentRole, NewBead};

    #[test]
    fn env_precedence() {
        let mut town = TownConfig::default();
        town.env_vars.insert("SHARED".into(), "town".into());
        town.env_vars.insert("TOWN_ONLY".into(), "1".into());
        town.git = GitCredentials {
            github_token: Some("gh".into()),
            gitlab_token: None,
            username: Some("town-user".into()),
        };
        town.model_api_key = Some("model-key".into());
        let mut rig = RigConfig::default();
        rig.env_vars.insert("SHARED".into(), "rig".into());
        rig.env_vars.insert("GITHUB_TOKEN".into(), "from-env".into());
        rig.git_username = Some("rig-user".into());

        let env = merged_env(&town, Some(&rig), &[("TOWN_ID", "t1".into())]);
        assert_eq!(env["SHARED"], "rig");
        assert_eq!(env["TOWN_ONLY"], "1");
        // credentials beat plain env vars
        assert_eq!(env["GITHUB_TOKEN"], "gh");
        assert_eq!(env["GIT_USERNAME"], "rig-user");
        assert_eq!(env["TOWN_MODEL_API_KEY"], "model-key");
        assert_eq!(env["TOWN_ID"], "t1");
    }

    #[test]
    fn start_request_carries_token_and_rig() {
        let mut h = harness();
        let rig = h.town.add_rig("api", "https://git.example/api.git", "trunk").unwrap();
        let bead = h.town.create_bead(&NewBead::task("fix bug").rig(&rig.id)).unwrap();
        let agent = h.town.get_or_create_agent(AgentRole::Polecat, None).unwrap();

        let req = h.town.prepare_start(&agent, StartPrompt::Bead(&bead)).unwrap();
        assert_eq!(req.rig_id, rig.id);
        assert_eq!(req.git_url, "https://git.example/api.git");
        assert_eq!(req.default_branch, "trunk");
        assert_eq!(req.branch, branch_for_agent("nux", &bead.id));
        assert!(req.prompt.contains("fix bug"));

        let claims = token::verify(SECRET, &req.env_vars["TOWN_SESSION_TOKEN"], h.town.now()).unwrap();
        assert_eq!(claims.agent_id, agent.id);
        assert_eq!(claims.rig_id, rig.id);
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(req.env_vars["TOWN_AGENT_ID"], agent.id);
    }

    #[test]
    fn merge_request_names_the_entry_and_its_author() {
        let mut h = harness();
        let rig = h.town.add_rig("api", "https://git.example/api.git", "trunk").unwrap();
        let bead = h.town.create_bead(&NewBead::task("fix bug").rig(&rig.id)).unwrap();
        let agent = h.town.get_or_create_agent(AgentRole::Polecat, None).unwrap();
        let entry = h
            .town
            .submit_review(&agent.id, &bead.id, "nux/fix-bug", None)
            .unwrap();

        let req = h.town.prepare_merge(&entry).unwrap();
        assert_eq!(req.entry_id, entry.id);
        assert_eq!(req.agent_id, agent.id);
        assert_eq!(req.bead_id, bead.id);
        assert_eq!(req.branch, "nux/fix-bug");
        assert_eq!(req.target_branch, "trunk");
    }

    #[test]
    fn tenant_wide_session_has_no_repo() {
        let h = harness();
        let mut town = h.town;
        let mayor = town.get_or_create_agent(AgentRole::Mayor, None).unwrap();
        let req = town
            .prepare_start(&mayor, StartPrompt::Message("wake up"))
            .unwrap();
        assert_eq!(req.git_url, "");
        assert_eq!(req.rig_id, "");
        assert_eq!(req.prompt, "wake up");
    }

    #[test]
    fn missing_secret_fails_the_start() {
        let mut h = harness();
        h.town.settings.auth.token_secret = None;
        let agent = h.town.get_or_create_agent(AgentRole::Mayor, None).unwrap();
        if std::env::var(crate::config::TOKEN_SECRET_ENV).is_err() {
            assert!(!h.town.start_agent_in_container(&agent, StartPrompt::Message("hi")));
            assert!(h.runtime.starts().is_empty());
        }
    }
}
