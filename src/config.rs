use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rand::seq::IndexedRandom;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::TownError;

/// Settings file name inside the data directory.
pub const SETTINGS_TOML: &str = "town.toml";

/// Longest duration any setting may name: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Environment variable that overrides `auth.token_secret`.
pub const TOKEN_SECRET_ENV: &str = "TOWN_TOKEN_SECRET";

/// Environment variable that overrides the default data directory.
pub const DATA_DIR_ENV: &str = "TOWN_DATA_DIR";

/// Resolve the data directory: explicit flag, then `$TOWN_DATA_DIR`, then the
/// platform data dir (`~/.local/share/town` on Linux).
pub fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join("town"))
        .context("could not determine a data directory; pass --data-dir")
}

/// Process-wide orchestrator settings (`town.toml`).
///
/// Every section is optional; a missing file yields the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub models: ModelsConfig,
}

/// Where the container runtime lives and how long to wait for it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeSettings {
    #[serde(default = "default_runtime_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_runtime_timeout")]
    pub timeout_secs: u64,
}

impl RuntimeSettings {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            url: default_runtime_url(),
            api_key: None,
            timeout_secs: default_runtime_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthSettings {
    /// HMAC secret for agent session tokens. Prefer `$TOWN_TOKEN_SECRET`.
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Base URL agents use to call back into the town API.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
            callback_url: default_callback_url(),
        }
    }
}

impl AuthSettings {
    pub fn token_ttl(&self) -> chrono::Duration {
        secs(self.token_ttl_secs)
    }

    /// The signing secret, with the environment taking precedence.
    pub fn secret(&self) -> Result<String, TownError> {
        if let Ok(secret) = std::env::var(TOKEN_SECRET_ENV)
            && !secret.is_empty()
        {
            return Ok(secret);
        }
        self.token_secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                TownError::Config(format!(
                    "no token secret: set auth.token_secret or ${TOKEN_SECRET_ENV}"
                ))
            })
    }
}

/// Scheduler policy. None of these values carry meaning beyond tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerSettings {
    #[serde(default = "default_active_interval")]
    pub active_interval_secs: u64,
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_escalation_base")]
    pub escalation_base_secs: u64,
    #[serde(default = "default_max_re_escalations")]
    pub max_re_escalations: u32,
    #[serde(default = "default_prime_context_limit")]
    pub prime_context_limit: usize,
    #[serde(default = "default_agent_log_max_events")]
    pub agent_log_max_events: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            active_interval_secs: default_active_interval(),
            idle_interval_secs: default_idle_interval(),
            max_dispatch_attempts: default_max_dispatch_attempts(),
            stale_threshold_secs: default_stale_threshold(),
            escalation_base_secs: default_escalation_base(),
            max_re_escalations: default_max_re_escalations(),
            prime_context_limit: default_prime_context_limit(),
            agent_log_max_events: default_agent_log_max_events(),
        }
    }
}

impl SchedulerSettings {
    pub fn active_interval(&self) -> chrono::Duration {
        secs(self.active_interval_secs)
    }

    pub fn idle_interval(&self) -> chrono::Duration {
        secs(self.idle_interval_secs)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        secs(self.stale_threshold_secs)
    }

    pub fn escalation_base(&self) -> chrono::Duration {
        secs(self.escalation_base_secs)
    }
}

/// Clamped to [`MAX_DURATION_SECS`]; loaded settings never exceed it.
fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(n.min(MAX_DURATION_SECS)).unwrap_or_default())
}

/// Model tier configuration for cross-provider load balancing.
///
/// Each tier maps to a list of `provider/model:thinking` strings.
/// When a town or rig config names a tier (e.g. "fast"), `resolve_model()`
/// randomly picks one model from that tier's pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelsConfig {
    #[serde(default = "default_tier_fast")]
    pub fast: Vec<String>,
    #[serde(default = "default_tier_balanced")]
    pub balanced: Vec<String>,
    #[serde(default = "default_tier_strong")]
    pub strong: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            fast: default_tier_fast(),
            balanced: default_tier_balanced(),
            strong: default_tier_strong(),
        }
    }
}

fn default_tier_fast() -> Vec<String> {
    vec![
        "anthropic/claude-haiku-4-5:low".into(),
        "google/gemini-3-flash:low".into(),
    ]
}

fn default_tier_balanced() -> Vec<String> {
    vec![
        "anthropic/claude-sonnet-4-6:medium".into(),
        "google/gemini-3-pro:medium".into(),
        "openai/gpt-5.3-codex:medium".into(),
    ]
}

fn default_tier_strong() -> Vec<String> {
    vec![
        "anthropic/claude-opus-4-6:high".into(),
        "openai/gpt-5.3-codex:xhigh".into(),
    ]
}

// Default value functions for serde
fn default_runtime_url() -> String { "http://127.0.0.1:8788".into() }
fn default_callback_url() -> String { "http://127.0.0.1:8787".into() }
const fn default_runtime_timeout() -> u64 { 30 }
const fn default_token_ttl() -> u64 { 8 * 60 * 60 }
const fn default_active_interval() -> u64 { 5 }
const fn default_idle_interval() -> u64 { 60 }
const fn default_max_dispatch_attempts() -> u32 { 5 }
const fn default_stale_threshold() -> u64 { 10 * 60 }
const fn default_escalation_base() -> u64 { 60 * 60 }
const fn default_max_re_escalations() -> u32 { 3 }
const fn default_prime_context_limit() -> usize { 20 }
const fn default_agent_log_max_events() -> usize { 2000 }
fn default_model() -> String { "balanced".into() }

impl Settings {
    /// Load settings from `dir/town.toml`, or defaults when the file is absent.
    pub fn load_from_dir(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(SETTINGS_TOML);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(toml_str)
            .map_err(|e| TownError::Config(format!("invalid {SETTINGS_TOML}: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects durations the alarm arithmetic cannot hold and intervals that
    /// would spin the scheduler.
    pub fn validate(&self) -> Result<(), TownError> {
        let scheduler = &self.scheduler;
        let durations = [
            ("runtime.timeout_secs", self.runtime.timeout_secs),
            ("auth.token_ttl_secs", self.auth.token_ttl_secs),
            ("scheduler.active_interval_secs", scheduler.active_interval_secs),
            ("scheduler.idle_interval_secs", scheduler.idle_interval_secs),
            ("scheduler.stale_threshold_secs", scheduler.stale_threshold_secs),
            ("scheduler.escalation_base_secs", scheduler.escalation_base_secs),
        ];
        for (key, value) in durations {
            if value > MAX_DURATION_SECS {
                return Err(TownError::Config(format!(
                    "invalid {SETTINGS_TOML}: {key} = {value} exceeds {MAX_DURATION_SECS}"
                )));
            }
        }
        for (key, value) in [
            ("scheduler.active_interval_secs", scheduler.active_interval_secs),
            ("scheduler.idle_interval_secs", scheduler.idle_interval_secs),
        ] {
            if value == 0 {
                return Err(TownError::Config(format!(
                    "invalid {SETTINGS_TOML}: {key} must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Serialize settings to a TOML string with section comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(item) = doc.get_mut(key)
                && let Some(tbl) = item.as_table_mut()
            {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        let raw = toml::to_string_pretty(self).context("serializing settings to TOML")?;
        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut().set_prefix("# Town orchestrator settings\n\n");
        set_table_comment(&mut doc, "runtime", "# Container runtime endpoint\n");
        set_table_comment(
            &mut doc,
            "auth",
            "\n# Agent session tokens (prefer $TOWN_TOKEN_SECRET over token_secret)\n",
        );
        set_table_comment(&mut doc, "scheduler", "\n# Scheduler policy\n");
        set_table_comment(
            &mut doc,
            "models",
            "\n# Model tier pools for load balancing\n# Each tier maps to a list of \"provider/model:thinking\" strings\n",
        );

        Ok(doc.to_string())
    }

    /// Resolve a model string: if it matches a tier name (fast/balanced/strong),
    /// randomly pick from that tier's pool. Otherwise pass through as-is.
    pub fn resolve_model(&self, model: &str) -> String {
        let pool = match model {
            "fast" => &self.models.fast,
            "balanced" => &self.models.balanced,
            "strong" => &self.models.strong,
            _ => return model.to_string(),
        };

        pool.choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

/// Tenant-wide configuration, persisted in the town store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TownConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Commands the refinery must see pass before merging. Empty means
    /// completed work goes straight to a deterministic merge.
    #[serde(default)]
    pub quality_gates: Vec<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub git: GitCredentials,
    /// Secret for the model routing gateway, forwarded to agents.
    #[serde(default)]
    pub model_api_key: Option<String>,
}

impl Default for TownConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            quality_gates: Vec::new(),
            env_vars: BTreeMap::new(),
            git: GitCredentials::default(),
            model_api_key: None,
        }
    }
}

impl TownConfig {
    pub fn has_quality_gates(&self) -> bool {
        self.quality_gates.iter().any(|g| !g.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCredentials {
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub gitlab_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Per-rig secrets and overrides. Never returned from rig listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default)]
    pub git_token: Option<String>,
    #[serde(default)]
    pub git_username: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_settings() {
        let toml_str = r#"
[runtime]
url = "http://runtime.internal:9000"
api_key = "rt-key"
timeout_secs = 10

[auth]
token_secret = "s3cret"
token_ttl_secs = 3600
callback_url = "https://town.example.com"

[scheduler]
active_interval_secs = 2
idle_interval_secs = 120
max_dispatch_attempts = 3
stale_threshold_secs = 300
escalation_base_secs = 900
max_re_escalations = 2
"#;

        let settings = Settings::parse_toml(toml_str).unwrap();
        assert_eq!(settings.runtime.url, "http://runtime.internal:9000");
        assert_eq!(settings.runtime.api_key.as_deref(), Some("rt-key"));
        assert_eq!(settings.auth.token_ttl_secs, 3600);
        assert_eq!(settings.scheduler.max_dispatch_attempts, 3);
        assert_eq!(settings.scheduler.escalation_base(), chrono::Duration::minutes(15));
        // untouched field keeps its default
        assert_eq!(settings.scheduler.prime_context_limit, 20);
    }

    #[test]
    fn empty_settings_use_defaults() {
        let settings = Settings::parse_toml("").unwrap();
        assert_eq!(settings.scheduler.active_interval_secs, 5);
        assert_eq!(settings.scheduler.idle_interval_secs, 60);
        assert_eq!(settings.scheduler.max_dispatch_attempts, 5);
        assert_eq!(settings.auth.token_ttl_secs, 8 * 60 * 60);
        assert!(!settings.models.balanced.is_empty());
    }

    #[test]
    fn parse_malformed_settings() {
        let err = Settings::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid town.toml"));
    }

    #[test]
    fn oversized_scheduler_seconds_are_rejected() {
        // large enough to overflow a millisecond duration
        let err = Settings::parse_toml("[scheduler]\nidle_interval_secs = 9223372036854775000\n")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TownError>(),
            Some(TownError::Config(msg)) if msg.contains("scheduler.idle_interval_secs")
        ));

        let err = Settings::parse_toml("[scheduler]\nescalation_base_secs = 18446744073709551615\n")
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<TownError>(), Some(TownError::Config(_))));

        let at_limit = format!("[auth]\ntoken_ttl_secs = {MAX_DURATION_SECS}\n");
        let settings = Settings::parse_toml(&at_limit).unwrap();
        assert_eq!(settings.auth.token_ttl(), chrono::Duration::days(365));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = Settings::parse_toml("[scheduler]\nactive_interval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn durations_built_in_code_are_clamped() {
        let mut settings = Settings::default();
        settings.scheduler.idle_interval_secs = u64::MAX;
        assert_eq!(settings.scheduler.idle_interval(), chrono::Duration::days(365));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_from_dir_without_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from_dir(dir.path()).unwrap();
        assert_eq!(settings.runtime.url, "http://127.0.0.1:8788");
    }

    #[test]
    fn roundtrip_toml_keeps_values_and_comments() {
        let mut settings = Settings::default();
        settings.scheduler.max_re_escalations = 7;
        let output = settings.to_toml().unwrap();
        assert!(output.contains("# Town orchestrator settings"));
        assert!(output.contains("# Scheduler policy"));
        let parsed = Settings::parse_toml(&output).unwrap();
        assert_eq!(parsed.scheduler.max_re_escalations, 7);
    }

    #[test]
    fn resolve_model_tiers_and_passthrough() {
        let settings = Settings::parse_toml(
            r#"
[models]
fast = ["custom/model-a"]
balanced = ["custom/model-b"]
strong = ["custom/model-c"]
"#,
        )
        .unwrap();

        assert_eq!(settings.resolve_model("fast"), "custom/model-a");
        assert_eq!(settings.resolve_model("balanced"), "custom/model-b");
        assert_eq!(settings.resolve_model("strong"), "custom/model-c");
        assert_eq!(
            settings.resolve_model("anthropic/claude-sonnet-4-6:medium"),
            "anthropic/claude-sonnet-4-6:medium"
        );
    }

    #[test]
    fn empty_tier_falls_back_to_name() {
        let settings = Settings::parse_toml("[models]\nfast = []\n").unwrap();
        assert_eq!(settings.resolve_model("fast"), "fast");
    }

    #[test]
    fn town_config_quality_gates() {
        let mut config = TownConfig::default();
        assert!(!config.has_quality_gates());
        config.quality_gates = vec!["  ".into()];
        assert!(!config.has_quality_gates());
        config.quality_gates = vec!["cargo test".into()];
        assert!(config.has_quality_gates());
        assert_eq!(config.default_model, "balanced");
    }

    #[test]
    fn town_config_parses_partial_json() {
        let config: TownConfig =
            serde_json::from_str(r#"{"quality_gates": ["just check"], "git": {"github_token": "ghp_x"}}"#)
                .unwrap();
        assert_eq!(config.quality_gates, vec!["just check"]);
        assert_eq!(config.git.github_token.as_deref(), Some("ghp_x"));
        assert_eq!(config.default_model, "balanced");
    }
}
