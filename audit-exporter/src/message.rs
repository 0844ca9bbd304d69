//! Decoded audit messages and their metric mapping

use serde::{Deserialize, Serialize};
use std::num::IntErrorKind;

/// A decoded, user-facing audit record
///
/// Produced by an audit source and consumed exactly once by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMessage {
    /// Record serial number as decimal text
    pub id: String,
    /// Originating user
    pub user: String,
    /// Executed command
    pub command: String,
    /// Command arguments, space separated
    pub args: String,
}

impl AuditMessage {
    /// Create a new message
    pub fn new(
        id: impl Into<String>,
        user: impl Into<String>,
        command: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            command: command.into(),
            args: args.into(),
        }
    }

    /// Series label: `user command args` joined by single spaces
    ///
    /// No escaping is applied, so distinct tuples can produce the same key.
    pub fn label_key(&self) -> String {
        format!("{} {} {}", self.user, self.command, self.args)
    }

    /// Numeric gauge value: `id` as an integer, or 0 when it does not parse
    ///
    /// Out-of-range ids saturate to `i64::MAX` or `i64::MIN`.
    pub fn metric_value(&self) -> f64 {
        let id = match self.id.parse::<i64>() {
            Ok(id) => id,
            Err(e) => match e.kind() {
                IntErrorKind::PosOverflow => i64::MAX,
                IntErrorKind::NegOverflow => i64::MIN,
                _ => 0,
            },
        };
        id as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_key_is_space_joined() {
        let msg = AuditMessage::new("42", "alice", "/bin/ls", "-la");
        assert_eq!(msg.label_key(), "alice /bin/ls -la");
    }

    #[test]
    fn test_label_key_keeps_empty_args() {
        let msg = AuditMessage::new("7", "root", "/usr/bin/id", "");
        assert_eq!(msg.label_key(), "root /usr/bin/id ");
    }

    #[test]
    fn test_distinct_tuples_can_collide() {
        let a = AuditMessage::new("1", "alice", "/bin/sh -c", "ls");
        let b = AuditMessage::new("2", "alice", "/bin/sh", "-c ls");
        assert_ne!(a, b);
        assert_eq!(a.label_key(), b.label_key());
    }

    #[test]
    fn test_metric_value_parses_id() {
        assert_eq!(AuditMessage::new("42", "", "", "").metric_value(), 42.0);
        assert_eq!(AuditMessage::new("-3", "", "", "").metric_value(), -3.0);
    }

    #[test]
    fn test_out_of_range_id_saturates() {
        let huge = AuditMessage::new("99999999999999999999", "", "", "");
        assert_eq!(huge.metric_value(), i64::MAX as f64);
        let tiny = AuditMessage::new("-99999999999999999999", "", "", "");
        assert_eq!(tiny.metric_value(), i64::MIN as f64);
        assert_eq!(AuditMessage::new("+7", "", "", "").metric_value(), 7.0);
    }

    #[test]
    fn test_unparseable_id_is_zero() {
        assert_eq!(AuditMessage::new("abc", "", "", "").metric_value(), 0.0);
        assert_eq!(AuditMessage::new("", "", "", "").metric_value(), 0.0);
    }
}
