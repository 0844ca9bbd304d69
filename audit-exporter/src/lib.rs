//! # audit-exporter
//!
//! Turns the Linux kernel audit record stream into Prometheus metrics.
//!
//! Every process execution seen by the audit subsystem becomes a `RuleStat`
//! gauge sample labelled with `"<user> <command> <args>"` and valued with the
//! event's serial number, served over HTTP for scraping.
//!
//! ## Pipeline
//!
//! - **Provisioning**: enable auditing, set limits, install a JSON rule set
//! - **Source**: read and assemble audit records into events
//! - **Classifier**: log every event and stream failure
//! - **Handoff**: bounded FIFO between source and aggregator
//! - **Aggregator**: paced consumer writing into the registry
//! - **Exporter**: `/metrics`, `/` and `/health` over axum
//!
//! ## Example
//!
//! ```rust,no_run
//! use audit_exporter::prelude::*;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load(None)?;
//!     init_tracing(&config)?;
//!
//!     let control = AuditctlControl::new(config.audit.auditctl.clone());
//!     Provisioner::new(control, &config.audit)
//!         .provision(Path::new("rules.json"))
//!         .await?;
//!
//!     let source = RecordStreamSource::open(
//!         config.audit.record_path.clone(),
//!         config.audit.follow,
//!         config.audit.poll_interval(),
//!     )
//!     .await?;
//!
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(shutdown_signal(shutdown.clone()));
//!     Exporter::new(config)?.run(source, shutdown).await
//! }
//! ```

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod control;
pub mod error;
pub mod handoff;
pub mod health;
pub mod message;
pub mod observability;
pub mod provision;
pub mod record;
pub mod registry;
pub mod rules;
pub mod server;
pub mod service;
pub mod source;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aggregator::Aggregator;
    pub use crate::classifier::{Classification, Classifier};
    pub use crate::config::{AuditConfig, Config, OverflowPolicy, PipelineConfig, ServiceConfig};
    pub use crate::control::{AuditControl, AuditctlControl};
    pub use crate::error::{Error, ProvisionError, ProvisionStep, Result};
    pub use crate::handoff::{HandoffReceiver, HandoffSender, SendOutcome};
    pub use crate::health::{SourceHealth, SourceStatus};
    pub use crate::message::AuditMessage;
    pub use crate::observability::init_tracing;
    pub use crate::provision::{Provisioned, Provisioner};
    pub use crate::record::{AuditEvent, AuditRecord};
    pub use crate::registry::MetricsRegistry;
    pub use crate::rules::AuditRules;
    pub use crate::server::{shutdown_signal, Server};
    pub use crate::service::Exporter;
    pub use crate::source::{AuditSource, RecordStreamSource, SourceError};

    pub use tokio_util::sync::CancellationToken;
}
