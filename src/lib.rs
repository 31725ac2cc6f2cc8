//! Town orchestrator - per-tenant control plane for containerized coding agents

pub mod agent_log;
pub mod background;
pub mod clock;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod token;
pub mod town;
pub mod types;
