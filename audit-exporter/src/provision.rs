//! Startup provisioning of the kernel audit subsystem

use std::path::Path;

use crate::config::AuditConfig;
use crate::control::AuditControl;
use crate::error::{Error, ProvisionError, ProvisionStep, Result};
use crate::rules::AuditRules;

/// Outcome of a successful provisioning run
#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    /// The installed rule set
    pub rules: AuditRules,
    /// Non-fatal warnings from rule installation
    pub warnings: Vec<String>,
}

/// Runs the startup steps in their fixed order, stopping at the first failure
pub struct Provisioner<C> {
    control: C,
    rate_limit: u32,
    backlog_limit: u32,
    pid: u32,
}

impl<C: AuditControl> Provisioner<C> {
    /// Create a provisioner with the configured limits, registering this process
    pub fn new(control: C, config: &AuditConfig) -> Self {
        Self {
            control,
            rate_limit: config.rate_limit,
            backlog_limit: config.backlog_limit,
            pid: std::process::id(),
        }
    }

    /// Override the registered process id
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Provision the audit subsystem with the rule set at `rules_path`
    pub async fn provision(&self, rules_path: &Path) -> Result<Provisioned> {
        tracing::info!(rules = %rules_path.display(), "Provisioning audit subsystem");

        step(ProvisionStep::Enable, self.control.set_enabled(true).await)?;
        step(ProvisionStep::SetPid, self.control.set_pid(self.pid).await)?;
        step(
            ProvisionStep::SetRateLimit,
            self.control.set_rate_limit(self.rate_limit).await,
        )?;
        step(
            ProvisionStep::SetBacklogLimit,
            self.control.set_backlog_limit(self.backlog_limit).await,
        )?;

        // Read and parse failures keep their own error variants
        let rules = AuditRules::load(rules_path).await?;

        step(ProvisionStep::DeleteRules, self.control.delete_all_rules().await)?;
        let warnings = step(ProvisionStep::SetRules, self.control.set_rules(&rules).await)?;

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        tracing::info!(
            rules = rules.len(),
            warnings = warnings.len(),
            "Audit subsystem provisioned"
        );

        Ok(Provisioned { rules, warnings })
    }
}

fn step<T>(step: ProvisionStep, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        tracing::error!(%step, "Provisioning failed: {}", e);
        Error::Provision(ProvisionError::new(step, e.to_string()))
    })
}
