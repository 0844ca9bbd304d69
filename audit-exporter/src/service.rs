//! Pipeline wiring
//!
//! Connects the audit source, the paced aggregator and the HTTP exporter:
//! source → handoff → aggregator → registry ← exporter. All three tasks share
//! one cancellation token.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::Aggregator,
    classifier::Classifier,
    config::Config,
    error::{Error, Result},
    handoff,
    health::SourceHealth,
    registry::MetricsRegistry,
    server::Server,
    source::AuditSource,
};

/// The assembled exporter pipeline
pub struct Exporter {
    config: Config,
    registry: MetricsRegistry,
}

impl Exporter {
    /// Create the pipeline and its registry from configuration
    pub fn new(config: Config) -> Result<Self> {
        let registry = MetricsRegistry::with_max_series(config.pipeline.max_series)?;
        Ok(Self { config, registry })
    }

    /// The registry the aggregator writes and the exporter reads
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Bind the configured port, then run until shutdown
    pub async fn run<S: AuditSource>(self, source: S, shutdown: CancellationToken) -> Result<()> {
        let listener = Server::new(self.config.clone(), self.registry.clone())
            .bind()
            .await?;
        self.serve(listener, source, shutdown).await
    }

    /// Run all three tasks, exporting on `listener`, until shutdown
    ///
    /// The source ending does not stop the exporter; the last values stay
    /// visible until shutdown.
    pub async fn serve<S: AuditSource>(
        self,
        listener: TcpListener,
        source: S,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let pipeline = &self.config.pipeline;
        tracing::info!(
            queue_capacity = pipeline.queue_capacity,
            overflow = %pipeline.overflow,
            pacing_ms = pipeline.pacing_interval_ms,
            max_series = ?pipeline.max_series,
            "Starting audit pipeline"
        );

        let (sender, receiver) = handoff::channel(pipeline.queue_capacity, pipeline.overflow);
        let callback = Classifier::new().into_callback();

        let source_health = SourceHealth::new();
        let reporter = source_health.clone();
        let source_shutdown = shutdown.clone();
        let source_task = tokio::spawn(async move {
            let result = Box::new(source).run(callback, sender, source_shutdown).await;
            match &result {
                Ok(()) => tracing::info!("Audit source finished"),
                Err(e) => tracing::error!("Audit source failed: {}", e),
            }
            reporter.finish(&result);
        });

        let aggregator = Aggregator::new(self.registry.clone(), pipeline.pacing_interval());
        let aggregator_task = tokio::spawn(aggregator.run(receiver, shutdown.clone()));

        let server = Server::new(self.config.clone(), self.registry.clone())
            .with_source_health(source_health);
        let served = server.serve(listener, shutdown.clone()).await;

        // The server only returns once shutdown began or serving failed
        shutdown.cancel();

        if let Err(e) = source_task.await {
            tracing::error!("Audit source task panicked: {}", e);
        }
        aggregator_task
            .await
            .map_err(|e| Error::Internal(format!("Aggregator task panicked: {}", e)))?;

        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::AuditControl;
    use crate::provision::Provisioner;
    use crate::rules::AuditRules;
    use crate::source::RecordStreamSource;
    use async_trait::async_trait;
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const LS_EVENT: &str = "\
type=SYSCALL msg=audit(1700000000.123:42): arch=c000003e syscall=59 success=yes auid=1000 uid=1000 exe=\"/bin/ls\"\u{1d}AUID=\"alice\" UID=\"alice\"
type=EXECVE msg=audit(1700000000.123:42): argc=2 a0=\"ls\" a1=\"-la\"
type=EOE msg=audit(1700000000.123:42):
";

    struct AcceptingControl;

    #[async_trait]
    impl AuditControl for AcceptingControl {
        async fn set_enabled(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }

        async fn set_pid(&self, _pid: u32) -> Result<()> {
            Ok(())
        }

        async fn set_rate_limit(&self, _limit: u32) -> Result<()> {
            Ok(())
        }

        async fn set_backlog_limit(&self, _limit: u32) -> Result<()> {
            Ok(())
        }

        async fn delete_all_rules(&self) -> Result<()> {
            Ok(())
        }

        async fn set_rules(&self, _rules: &AuditRules) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl AuditSource for BrokenSource {
        async fn run(
            self: Box<Self>,
            _callback: crate::source::EventCallback,
            _handoff: crate::handoff::HandoffSender,
            _shutdown: CancellationToken,
        ) -> Result<()> {
            Err(Error::Io(std::io::Error::other("device removed")))
        }
    }

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_execution_is_exported_end_to_end() {
        let mut config = Config::default();
        config.pipeline.pacing_interval_ms = 10;

        let mut rules = tempfile::NamedTempFile::new().unwrap();
        write!(rules, r#"{{"rules":[]}}"#).unwrap();
        let provisioned = Provisioner::new(AcceptingControl, &config.audit)
            .provision(rules.path())
            .await
            .unwrap();
        assert!(provisioned.warnings.is_empty());

        let exporter = Exporter::new(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let source = RecordStreamSource::new(LS_EVENT.as_bytes(), false, Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(exporter.serve(listener, source, shutdown.clone()));

        let expected = "RuleStat{rulestats=\"alice /bin/ls -la\"} 42";
        let mut body = String::new();
        for _ in 0..100 {
            body = get(addr, "/metrics").await;
            if body.contains(expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(body.contains(expected), "metrics were:\n{}", body);
        assert!(body.contains("audit_exporter_messages_processed_total 1"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_source_is_reported_on_health() {
        let exporter = Exporter::new(Config::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(exporter.serve(listener, BrokenSource, shutdown.clone()));

        let mut body = String::new();
        for _ in 0..100 {
            body = get(addr, "/health").await;
            if body.contains("unhealthy") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(body.starts_with("HTTP/1.1 503"), "health was:\n{}", body);
        assert!(body.contains("device removed"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bounded_series_config_reaches_registry() {
        let mut config = Config::default();
        config.pipeline.max_series = Some(1);
        let exporter = Exporter::new(config).unwrap();

        exporter.registry().set("a", 1.0);
        exporter.registry().set("b", 2.0);
        assert_eq!(exporter.registry().series_count(), 1);
    }
}
