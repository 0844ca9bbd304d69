//! Kernel audit subsystem control
//!
//! [`AuditControl`] is the seam between provisioning and the kernel. The
//! bundled implementation drives the `auditctl` tool.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::rules::AuditRules;

/// Control operations on the kernel audit subsystem
#[async_trait]
pub trait AuditControl: Send + Sync {
    /// Enable or disable auditing
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Make sure audit records are delivered for process `pid` to consume
    async fn set_pid(&self, pid: u32) -> Result<()>;

    /// Maximum messages per second
    async fn set_rate_limit(&self, limit: u32) -> Result<()>;

    /// Maximum queued audit buffers
    async fn set_backlog_limit(&self, limit: u32) -> Result<()>;

    /// Remove all installed rules
    async fn delete_all_rules(&self) -> Result<()>;

    /// Install a rule set, returning non-fatal warnings
    async fn set_rules(&self, rules: &AuditRules) -> Result<Vec<String>>;
}

/// [`AuditControl`] backed by the `auditctl` command
#[derive(Debug, Clone)]
pub struct AuditctlControl {
    program: PathBuf,
}

impl AuditctlControl {
    /// Use the given `auditctl` binary
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn auditctl(&self, args: &[String]) -> Result<String> {
        tracing::debug!(program = %self.program.display(), ?args, "Running auditctl");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::Internal(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Internal(format!(
                "{} {} exited with {}: {}",
                self.program.display(),
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn auditctl_str(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.auditctl(&args).await
    }
}

impl Default for AuditctlControl {
    fn default() -> Self {
        Self::new("auditctl")
    }
}

/// Extract the registered receiver pid from `auditctl -s` output
pub fn parse_status_pid(status: &str) -> Option<u32> {
    status.split_whitespace().collect::<Vec<_>>().windows(2).find_map(|pair| {
        if pair[0] == "pid" {
            pair[1].parse().ok()
        } else {
            None
        }
    })
}

#[async_trait]
impl AuditControl for AuditctlControl {
    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let flag = if enabled { "1" } else { "0" };
        self.auditctl_str(&["-e", flag]).await.map(|_| ())
    }

    async fn set_pid(&self, pid: u32) -> Result<()> {
        let status = self.auditctl_str(&["-s"]).await?;
        match parse_status_pid(&status) {
            Some(0) | None => Err(Error::Internal(
                "no audit daemon is registered to receive records".to_string(),
            )),
            Some(receiver) => {
                tracing::info!(receiver, exporter = pid, "Audit records delivered via audit daemon");
                Ok(())
            }
        }
    }

    async fn set_rate_limit(&self, limit: u32) -> Result<()> {
        self.auditctl_str(&["-r", &limit.to_string()]).await.map(|_| ())
    }

    async fn set_backlog_limit(&self, limit: u32) -> Result<()> {
        self.auditctl_str(&["-b", &limit.to_string()]).await.map(|_| ())
    }

    async fn delete_all_rules(&self) -> Result<()> {
        self.auditctl_str(&["-D"]).await.map(|_| ())
    }

    async fn set_rules(&self, rules: &AuditRules) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for rule in &rules.file_rules {
            let exists = tokio::fs::try_exists(&rule.path).await.unwrap_or(false);
            if !exists {
                if rule.strict_path_check {
                    return Err(Error::Internal(format!(
                        "watched path {} does not exist",
                        rule.path
                    )));
                }
                warnings.push(format!("skipping watch on missing path {}", rule.path));
                continue;
            }
            self.auditctl(&rule.to_args()).await?;
        }

        for rule in &rules.syscall_rules {
            let args = rule
                .to_args()
                .map_err(|e| Error::Internal(format!("invalid syscall rule: {}", e)))?;
            self.auditctl(&args).await?;
        }

        Ok(warnings)
    }
}
