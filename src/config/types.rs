use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::EngineConfig;
use crate::plan::{ResourcePlan, StaticPlans};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdletConfig {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub plans: PlanSettings,
}

/// Identity the server injects into every container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Injected as `CMDLET_SERVER`.
    pub name: String,
    /// Injected as `CMDLET_RELEASE`.
    pub release: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "cmdlet".to_string(),
            release: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Container-engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Image of the agent-forwarding helper container.
    pub agent_image: String,
    /// Docker unix-socket path; the platform default when unset.
    pub docker_host: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            agent_image: "cmdlet/agent-proxy:latest".to_string(),
            docker_host: None,
        }
    }
}

/// Resource plans: one default plus per-owner overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSettings {
    pub default: ResourcePlan,
    pub overrides: HashMap<String, ResourcePlan>,
}

impl CmdletConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            server_name: self.server.name.clone(),
            release: self.server.release.clone(),
            agent_image: self.engine.agent_image.clone(),
            docker_host: self.engine.docker_host.clone(),
        }
    }

    pub fn plan_source(&self) -> StaticPlans {
        let mut plans = StaticPlans::new(self.plans.default.clone());
        for (owner, plan) in &self.plans.overrides {
            plans = plans.with_override(owner.clone(), plan.clone());
        }
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanSource;

    #[test]
    fn empty_config_uses_defaults() {
        let config: CmdletConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.name, "cmdlet");
        assert_eq!(config.plans.default, ResourcePlan::default());
    }

    #[test]
    fn plan_overrides_are_applied() {
        let config: CmdletConfig = toml::from_str(
            r#"
            [plans.default]
            max_runtime_secs = 120

            [plans.overrides.alice]
            max_runtime_secs = 3600
            "#,
        )
        .unwrap();
        let plans = config.plan_source();
        assert_eq!(plans.plan_for("alice").max_runtime_secs, 3600);
        assert_eq!(plans.plan_for("bob").max_runtime_secs, 120);
    }
}
