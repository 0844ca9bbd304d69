//! Diagnostic classification of source outcomes
//!
//! Purely advisory: nothing here touches the metrics registry and no failure
//! escalates beyond a log line.

use serde::Serialize;

use crate::source::{EventCallback, SourceError, SourceOutcome};

/// How an outcome was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The event was serialized and emitted
    Event(String),
    /// A record could not be parsed
    ParseFailure,
    /// Opaque source failure
    Failure,
    /// The event could not be serialized and was dropped
    Unserializable,
}

/// Routes events and errors to diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier;

impl Classifier {
    /// Create a classifier
    pub fn new() -> Self {
        Self
    }

    /// Classify one outcome, emitting exactly one diagnostic line
    pub fn classify(&self, outcome: SourceOutcome) -> Classification {
        match outcome {
            Err(SourceError::Parse { description, raw }) => {
                tracing::warn!(%raw, "parser error: {}", description);
                Classification::ParseFailure
            }
            Err(SourceError::Generic { message }) => {
                tracing::warn!("callback received error: {}", message);
                Classification::Failure
            }
            Ok(event) => self.serialize(&event),
        }
    }

    fn serialize<T: Serialize>(&self, event: &T) -> Classification {
        match serde_json::to_string(event) {
            Ok(json) => {
                tracing::info!(event = %json, "audit event");
                Classification::Event(json)
            }
            Err(e) => {
                tracing::warn!("callback was unable to marshal event: {}", e);
                Classification::Unserializable
            }
        }
    }

    /// Adapt into a source callback
    pub fn into_callback(self) -> EventCallback {
        Box::new(move |outcome| {
            self.classify(outcome);
        })
    }
}

/// Convenience for one-off classification of an event
pub fn classify(outcome: SourceOutcome) -> Classification {
    Classifier::new().classify(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{parse_record, AuditEvent};
    use std::collections::HashMap;

    fn event() -> AuditEvent {
        let record = parse_record("type=EXECVE msg=audit(1.0:42): argc=2 a0=\"ls\" a1=\"-la\"").unwrap();
        AuditEvent {
            serial: record.serial,
            timestamp: record.timestamp,
            records: vec![record],
        }
    }

    #[test]
    fn test_event_is_serialized() {
        match classify(Ok(event())) {
            Classification::Event(json) => {
                assert!(json.contains("\"serial\":42"));
                assert!(json.contains("\"a1\":\"-la\""));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_failure_is_classified() {
        let outcome = Err(SourceError::Parse {
            description: "missing record type".to_string(),
            raw: "garbage".to_string(),
        });
        assert_eq!(classify(outcome), Classification::ParseFailure);
    }

    #[test]
    fn test_generic_failure_is_classified() {
        let outcome = Err(SourceError::Generic {
            message: "connection reset".to_string(),
        });
        assert_eq!(classify(outcome), Classification::Failure);
    }

    #[test]
    fn test_serialization_failure_drops_event() {
        // JSON object keys must be strings
        let mut unserializable = HashMap::new();
        unserializable.insert(vec![1u8], 1);
        assert_eq!(
            Classifier::new().serialize(&unserializable),
            Classification::Unserializable
        );
    }

    #[test]
    fn test_callback_accepts_every_outcome() {
        let mut callback = Classifier::new().into_callback();
        callback(Ok(event()));
        callback(Err(SourceError::Generic {
            message: "eof".to_string(),
        }));
    }
}
