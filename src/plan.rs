use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CmdletError, Result};

/// Per-owner resource ceilings, read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePlan {
    /// Maximum number of commands an owner may define.
    pub max_commands: u32,
    /// Wall-clock ceiling for one invocation, in seconds.
    pub max_runtime_secs: u64,
    /// Image size ceiling in bytes.
    pub max_image_size: i64,
    /// CPU share as a period/quota pair (microseconds).
    pub cpu_period: i64,
    pub cpu_quota: i64,
    /// Memory ceiling in bytes.
    pub max_memory: i64,
}

impl Default for ResourcePlan {
    fn default() -> Self {
        Self {
            max_commands: 20,
            max_runtime_secs: 300,
            max_image_size: 1024 * 1024 * 1024,
            cpu_period: 100_000,
            cpu_quota: 100_000,
            max_memory: 256 * 1024 * 1024,
        }
    }
}

impl ResourcePlan {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    /// Management-side check before a new command is created: `current` is
    /// the owner's existing command count.
    pub fn allows_another_command(&self, current: usize) -> Result<()> {
        if current >= self.max_commands as usize {
            return Err(CmdletError::CommandLimit {
                max: self.max_commands,
            });
        }
        Ok(())
    }
}

/// Plan lookup by owner identity. A pure read; billing integrations implement
/// this against their own source of truth.
pub trait PlanSource: Send + Sync {
    fn plan_for(&self, owner: &str) -> ResourcePlan;
}

/// Config-backed plan source: one default plan plus per-owner overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticPlans {
    default: ResourcePlan,
    overrides: HashMap<String, ResourcePlan>,
}

impl StaticPlans {
    pub fn new(default: ResourcePlan) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, owner: impl Into<String>, plan: ResourcePlan) -> Self {
        self.overrides.insert(owner.into(), plan);
        self
    }
}

impl PlanSource for StaticPlans {
    fn plan_for(&self, owner: &str) -> ResourcePlan {
        self.overrides
            .get(owner)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
