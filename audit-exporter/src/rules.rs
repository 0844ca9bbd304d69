//! Audit rule-set documents
//!
//! A rule set is a JSON document validated by deserializing it into
//! [`AuditRules`]. Unknown top-level keys are ignored, so `{"rules":[]}` is
//! an empty, valid rule set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// A complete rule set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRules {
    /// File watch rules
    #[serde(default)]
    pub file_rules: Vec<FileRule>,

    /// System call rules
    #[serde(default)]
    pub syscall_rules: Vec<SyscallRule>,
}

/// Watch a path for the given access permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRule {
    /// Watched path
    pub path: String,

    /// Filter key attached to matching records
    #[serde(default)]
    pub key: String,

    /// Access permissions: any of `r`, `w`, `x`, `a`
    #[serde(default)]
    pub permission: String,

    /// Fail instead of skipping when the path does not exist
    #[serde(default)]
    pub strict_path_check: bool,
}

/// Audit the given system calls when all fields match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallRule {
    /// Filter key attached to matching records
    #[serde(default)]
    pub key: String,

    /// Field comparisons
    #[serde(default)]
    pub fields: Vec<FieldSpec>,

    /// System call names
    #[serde(default)]
    pub syscalls: Vec<String>,

    /// Action and filter list, e.g. `["always", "exit"]`
    pub actions: Vec<String>,
}

/// One field comparison of a syscall rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, e.g. `arch` or `auid`
    pub name: String,

    /// Comparison value; numbers and strings are accepted
    pub value: serde_json::Value,

    /// Operator name: `eq`, `neq`, `gt`, `ge`, `lt`, `le`, `bitmask`, `bittest`
    pub op: String,
}

const ACTIONS: &[&str] = &["always", "never"];
const LISTS: &[&str] = &["exit", "task", "user", "exclude", "filesystem", "io_uring"];

/// A rule that cannot be expressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRule(pub String);

impl fmt::Display for InvalidRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidRule {}

impl AuditRules {
    /// Parse a rule set from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a rule-set file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::RuleFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&text)
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.file_rules.len() + self.syscall_rules.len()
    }

    /// Whether the rule set installs nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileRule {
    /// `auditctl` arguments for this watch
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-w".to_string(), self.path.clone()];
        if !self.permission.is_empty() {
            args.push("-p".to_string());
            args.push(self.permission.clone());
        }
        if !self.key.is_empty() {
            args.push("-k".to_string());
            args.push(self.key.clone());
        }
        args
    }
}

impl SyscallRule {
    /// `auditctl` arguments for this rule
    ///
    /// Actions may be given in either order; exactly one action and one
    /// filter list are required.
    pub fn to_args(&self) -> std::result::Result<Vec<String>, InvalidRule> {
        let action = self
            .actions
            .iter()
            .find(|a| ACTIONS.contains(&a.as_str()))
            .ok_or_else(|| InvalidRule(format!("no action in {:?}", self.actions)))?;
        let list = self
            .actions
            .iter()
            .find(|a| LISTS.contains(&a.as_str()))
            .ok_or_else(|| InvalidRule(format!("no filter list in {:?}", self.actions)))?;

        let mut args = vec!["-a".to_string(), format!("{},{}", action, list)];

        for syscall in &self.syscalls {
            args.push("-S".to_string());
            args.push(syscall.clone());
        }

        for field in &self.fields {
            args.push("-F".to_string());
            args.push(field.to_arg()?);
        }

        if !self.key.is_empty() {
            args.push("-k".to_string());
            args.push(self.key.clone());
        }

        Ok(args)
    }
}

impl FieldSpec {
    /// `name<op>value` as accepted by `auditctl -F`
    pub fn to_arg(&self) -> std::result::Result<String, InvalidRule> {
        let op = match self.op.as_str() {
            "eq" => "=",
            "neq" => "!=",
            "gt" => ">",
            "ge" => ">=",
            "lt" => "<",
            "le" => "<=",
            "bitmask" => "&",
            "bittest" => "&=",
            other => return Err(InvalidRule(format!("unknown operator '{}'", other))),
        };

        let value = match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(InvalidRule(format!(
                    "unsupported value {} for field '{}'",
                    other, self.name
                )))
            }
        };

        Ok(format!("{}{}{}", self.name, op, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RULES: &str = r#"{
        "delete": true,
        "file_rules": [
            {"path": "/etc/passwd", "key": "passwd", "permission": "wa"}
        ],
        "syscall_rules": [
            {
                "key": "exec",
                "fields": [
                    {"name": "arch", "value": 64, "op": "eq"},
                    {"name": "auid", "value": "unset", "op": "neq"}
                ],
                "syscalls": ["execve"],
                "actions": ["exit", "always"]
            }
        ]
    }"#;

    #[test]
    fn test_empty_rule_set_with_unknown_key_is_valid() {
        let rules = AuditRules::from_json(r#"{"rules":[]}"#).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_parse_full_rule_set() {
        let rules = AuditRules::from_json(RULES).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.file_rules[0].path, "/etc/passwd");
        assert_eq!(rules.syscall_rules[0].fields.len(), 2);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(matches!(
            AuditRules::from_json("{\"file_rules\": 3}"),
            Err(Error::RuleParse(_))
        ));
        assert!(AuditRules::from_json("not json").is_err());
    }

    #[test]
    fn test_file_rule_args() {
        let rules = AuditRules::from_json(RULES).unwrap();
        assert_eq!(
            rules.file_rules[0].to_args(),
            vec!["-w", "/etc/passwd", "-p", "wa", "-k", "passwd"]
        );
    }

    #[test]
    fn test_syscall_rule_args_normalize_action_order() {
        let rules = AuditRules::from_json(RULES).unwrap();
        assert_eq!(
            rules.syscall_rules[0].to_args().unwrap(),
            vec![
                "-a",
                "always,exit",
                "-S",
                "execve",
                "-F",
                "arch=64",
                "-F",
                "auid!=unset",
                "-k",
                "exec"
            ]
        );
    }

    #[test]
    fn test_syscall_rule_without_list_is_invalid() {
        let rule = SyscallRule {
            key: String::new(),
            fields: vec![],
            syscalls: vec!["open".to_string()],
            actions: vec!["always".to_string()],
        };
        assert!(rule.to_args().unwrap_err().0.contains("filter list"));
    }

    #[test]
    fn test_unknown_operator_is_invalid() {
        let field = FieldSpec {
            name: "uid".to_string(),
            value: serde_json::json!(0),
            op: "approx".to_string(),
        };
        assert!(field.to_arg().is_err());
    }

    #[tokio::test]
    async fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", RULES).unwrap();
        let rules = AuditRules::load(file.path()).await.unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = AuditRules::load(Path::new("/nonexistent/rules.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuleFile { .. }));
    }
}
