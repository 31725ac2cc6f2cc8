//! Domain entities owned by a town.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Enums persisted as lowercase text columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($name))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum!(
    /// Discriminates ordinary work from mail and agent markers.
    BeadType {
        Task => "task",
        Message => "message",
        Agent => "agent",
    }
);

text_enum!(BeadStatus {
    Open => "open",
    InProgress => "in_progress",
    Closed => "closed",
    Failed => "failed",
});

impl BeadStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

text_enum!(
    #[derive(PartialOrd, Ord)]
    Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

text_enum!(AgentRole {
    Mayor => "mayor",
    Polecat => "polecat",
    Refinery => "refinery",
    Witness => "witness",
});

impl AgentRole {
    /// Singleton roles have at most one instance per town.
    pub const fn is_singleton(self) -> bool {
        !matches!(self, Self::Polecat)
    }
}

text_enum!(AgentStatus {
    Idle => "idle",
    Working => "working",
    Blocked => "blocked",
    Exited => "exited",
    Failed => "failed",
});

impl AgentStatus {
    /// Whether a container process is expected to be running.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Working | Self::Blocked)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }
}

text_enum!(ReviewStatus {
    Pending => "pending",
    Running => "running",
    Merged => "merged",
    Failed => "failed",
});

impl ReviewStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed)
    }
}

text_enum!(ConvoyStatus {
    Active => "active",
    Landed => "landed",
});

text_enum!(ConvoyBeadStatus {
    Open => "open",
    Closed => "closed",
});

text_enum!(
    #[derive(PartialOrd, Ord)]
    Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

impl Severity {
    /// One level up, saturating at critical.
    pub const fn bump(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Severities at or above medium reach the mayor.
    pub fn notifies_mayor(self) -> bool {
        self >= Self::Medium
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(rename = "type")]
    pub bead_type: BeadType,
    pub status: BeadStatus,
    pub title: String,
    pub body: Option<String>,
    pub rig_id: Option<String>,
    pub assignee_id: Option<String>,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Input for creating a bead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBead {
    #[serde(rename = "type", default = "default_bead_type")]
    pub bead_type: BeadType,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub rig_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

const fn default_bead_type() -> BeadType {
    BeadType::Task
}

impl Default for BeadType {
    fn default() -> Self {
        default_bead_type()
    }
}

impl NewBead {
    pub fn task(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn rig(mut self, rig_id: impl Into<String>) -> Self {
        self.rig_id = Some(rig_id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BeadFilter {
    pub status: Option<BeadStatus>,
    pub bead_type: Option<BeadType>,
    pub rig_id: Option<String>,
    pub assignee_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadEvent {
    pub id: i64,
    pub bead_id: String,
    pub agent_id: Option<String>,
    pub event_type: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: AgentRole,
    pub name: String,
    pub identity: String,
    pub rig_id: Option<String>,
    pub status: AgentStatus,
    pub current_hook_bead_id: Option<String>,
    pub dispatch_attempts: u32,
    pub checkpoint: Option<serde_json::Value>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub stale_nudged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub role: Option<AgentRole>,
    pub status: Option<AgentStatus>,
    pub rig_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub id: String,
    pub from_identity: String,
    pub to_agent_id: String,
    pub subject: String,
    pub body: String,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub id: String,
    pub agent_id: String,
    pub bead_id: String,
    pub branch: String,
    pub status: ReviewStatus,
    pub summary: Option<String>,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Terminal outcome of a review, from a merge call or the refinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Merged { commit_sha: Option<String> },
    Failed { error: String },
}

impl ReviewOutcome {
    pub const fn status(&self) -> ReviewStatus {
        match self {
            Self::Merged { .. } => ReviewStatus::Merged,
            Self::Failed { .. } => ReviewStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convoy {
    pub id: String,
    pub title: String,
    pub status: ConvoyStatus,
    pub total_beads: u32,
    pub closed_beads: u32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub landed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvoyBead {
    pub convoy_id: String,
    pub bead_id: String,
    pub rig_id: Option<String>,
    pub status: ConvoyBeadStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub source_rig_id: String,
    pub source_agent_id: Option<String>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub acknowledged: bool,
    pub re_escalation_count: u32,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEscalation {
    pub source_rig_id: String,
    #[serde(default)]
    pub source_agent_id: Option<String>,
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: String,
    pub message: String,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EscalationFilter {
    pub acknowledged: Option<bool>,
    pub min_severity: Option<Severity>,
}

/// Listable registry entry. Credentials live in [`crate::config::RigConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rig {
    pub id: String,
    pub name: String,
    pub git_url: String,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
}

/// Everything an agent needs when it wakes up.
#[derive(Debug, Clone, Serialize)]
pub struct PrimeContext {
    pub agent: Agent,
    pub hooked_bead: Option<Bead>,
    pub mail: Vec<Mail>,
    pub open_beads: Vec<Bead>,
    pub failed_reviews: Vec<ReviewEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bump_saturates() {
        assert_eq!(Severity::Low.bump(), Severity::Medium);
        assert_eq!(Severity::Medium.bump(), Severity::High);
        assert_eq!(Severity::High.bump(), Severity::Critical);
        assert_eq!(Severity::Critical.bump(), Severity::Critical);
    }

    #[test]
    fn severity_order_matches_escalation_ladder() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert!(!Severity::Low.notifies_mayor());
        assert!(Severity::Medium.notifies_mayor());
    }

    #[test]
    fn text_enums_parse_their_own_output() {
        for status in BeadStatus::ALL {
            assert_eq!(status.as_str().parse::<BeadStatus>().unwrap(), *status);
        }
        assert!("done".parse::<BeadStatus>().is_err());
    }

    #[test]
    fn singleton_roles() {
        assert!(AgentRole::Mayor.is_singleton());
        assert!(AgentRole::Refinery.is_singleton());
        assert!(AgentRole::Witness.is_singleton());
        assert!(!AgentRole::Polecat.is_singleton());
    }

    #[test]
    fn new_bead_defaults_to_medium_task() {
        let bead: NewBead = serde_json::from_str(r#"{"title": "fix bug"}"#).unwrap();
        assert_eq!(bead.bead_type, BeadType::Task);
        assert_eq!(bead.priority, Priority::Medium);
        assert!(bead.labels.is_empty());
    }
}
