//! Audit sources
//!
//! A source runs for the process lifetime. For every assembled event or
//! failure it invokes the event callback, and for every process execution it
//! pushes a derived [`AuditMessage`] into the handoff.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handoff::{HandoffSender, SendOutcome};
use crate::message::AuditMessage;
use crate::record::{parse_record, AuditEvent, EventAssembler};

/// Per-record stream failure; never aborts the stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// A record could not be parsed; carries the offending raw record
    #[error("parser error: {description}")]
    Parse {
        /// What is malformed
        description: String,
        /// The raw record
        raw: String,
    },

    /// Any other failure
    #[error("{message}")]
    Generic {
        /// Error description
        message: String,
    },
}

/// What the source reports for each event
pub type SourceOutcome = std::result::Result<AuditEvent, SourceError>;

/// Callback invoked by a source for every event or failure
pub type EventCallback = Box<dyn FnMut(SourceOutcome) + Send>;

/// Producer of audit events and messages
#[async_trait]
pub trait AuditSource: Send + 'static {
    /// Run until shutdown, end of input, or the handoff closing
    async fn run(
        self: Box<Self>,
        callback: EventCallback,
        handoff: HandoffSender,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Reads kernel audit text records from a byte stream
///
/// In follow mode, reaching the end of input waits for more data instead of
/// stopping, like `tail -f`. A line is only parsed once its newline has been
/// written. Sources opened from a path reopen the path when the file is
/// rotated away or truncated.
pub struct RecordStreamSource {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    follow: bool,
    poll_interval: Duration,
    name: String,
    file: Option<FollowedFile>,
    partial: Vec<u8>,
}

/// Path and identity of the file being read
struct FollowedFile {
    path: PathBuf,
    identity: Option<(u64, u64)>,
    position: u64,
}

impl FollowedFile {
    /// Whether the path now names a different or shorter file
    async fn rotated(&self) -> bool {
        // Missing between rename and recreate; keep the current handle
        let Ok(metadata) = tokio::fs::metadata(&self.path).await else {
            return false;
        };
        let replaced = matches!(
            (file_identity(&metadata), self.identity),
            (Some(current), Some(opened)) if current != opened
        );
        replaced || metadata.len() < self.position
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

async fn open_file(path: &Path) -> Result<(tokio::fs::File, Option<(u64, u64)>)> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        Error::Internal(format!("Failed to open audit records {}: {}", path.display(), e))
    })?;
    let identity = file.metadata().await.ok().as_ref().and_then(file_identity);
    Ok((file, identity))
}

impl RecordStreamSource {
    /// Open a record file such as the audit daemon's log
    pub async fn open(path: impl Into<PathBuf>, follow: bool, poll_interval: Duration) -> Result<Self> {
        let path = path.into();
        let (file, identity) = open_file(&path).await?;
        let mut source = Self::new(file, follow, poll_interval);
        source.name = path.display().to_string();
        source.file = Some(FollowedFile {
            path,
            identity,
            position: 0,
        });
        Ok(source)
    }

    /// Wrap any reader
    pub fn new(reader: impl AsyncRead + Unpin + Send + 'static, follow: bool, poll_interval: Duration) -> Self {
        let reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        Self {
            reader: BufReader::new(reader),
            follow,
            poll_interval,
            name: "stream".to_string(),
            file: None,
            partial: Vec::new(),
        }
    }

    /// Reopen the followed path from its start
    ///
    /// Returns false for plain streams or when the path cannot be opened.
    async fn reopen(&mut self) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        match open_file(&file.path).await {
            Ok((handle, identity)) => {
                tracing::info!(source = %self.name, "Audit record file rotated, reopening");
                file.identity = identity;
                file.position = 0;
                let reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(handle);
                self.reader = BufReader::new(reader);
                self.partial.clear();
                true
            }
            Err(e) => {
                tracing::warn!(source = %self.name, "Reopen failed: {}", e);
                false
            }
        }
    }

    fn advance(&mut self, bytes: usize) {
        if let Some(file) = self.file.as_mut() {
            file.position += bytes as u64;
        }
    }

    /// Report an event and hand its message off
    ///
    /// Returns false once the handoff is closed.
    async fn deliver(
        event: AuditEvent,
        callback: &mut EventCallback,
        handoff: &HandoffSender,
    ) -> bool {
        let message = event.to_message();
        callback(Ok(event));

        if let Some(message) = message {
            return Self::hand_off(message, handoff).await;
        }
        true
    }

    async fn hand_off(message: AuditMessage, handoff: &HandoffSender) -> bool {
        match handoff.send(message).await {
            Ok(SendOutcome::Queued) => true,
            Ok(outcome) => {
                tracing::debug!(?outcome, dropped = handoff.dropped(), "Handoff full");
                true
            }
            Err(_) => {
                tracing::info!("Handoff closed, stopping audit source");
                false
            }
        }
    }

    /// Parse one complete line; returns false once the handoff is closed
    async fn handle_line(
        line: &[u8],
        assembler: &mut EventAssembler,
        callback: &mut EventCallback,
        handoff: &HandoffSender,
    ) -> bool {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(e) => {
                callback(Err(SourceError::Parse {
                    description: format!("record is not valid UTF-8: {}", e),
                    raw: String::from_utf8_lossy(line).trim_end().to_string(),
                }));
                return true;
            }
        };
        if text.trim().is_empty() {
            return true;
        }

        match parse_record(text) {
            Ok(record) => match assembler.push(record) {
                Some(event) => Self::deliver(event, callback, handoff).await,
                None => true,
            },
            Err(description) => {
                callback(Err(SourceError::Parse {
                    description,
                    raw: text.trim_end().to_string(),
                }));
                true
            }
        }
    }
}

#[async_trait]
impl AuditSource for RecordStreamSource {
    async fn run(
        mut self: Box<Self>,
        mut callback: EventCallback,
        handoff: HandoffSender,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(source = %self.name, follow = self.follow, "Audit source started");

        let mut assembler = EventAssembler::new();
        let mut buf = Vec::new();
        let mut idle = false;

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    if !self.follow {
                        if let Some(event) = assembler.flush() {
                            Self::deliver(event, &mut callback, &handoff).await;
                        }
                        break;
                    }

                    if idle {
                        // A pending event is complete once a full poll passes without records
                        if self.partial.is_empty() {
                            if let Some(event) = assembler.flush() {
                                if !Self::deliver(event, &mut callback, &handoff).await {
                                    return Ok(());
                                }
                            }
                        }
                        let rotated = match &self.file {
                            Some(file) => file.rotated().await,
                            None => false,
                        };
                        if rotated && self.reopen().await {
                            idle = false;
                            continue;
                        }
                    }

                    idle = true;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Ok(read) => {
                    idle = false;
                    self.advance(read);

                    // The writer has not finished this line yet
                    if self.follow && buf.last() != Some(&b'\n') {
                        self.partial.extend_from_slice(&buf);
                        continue;
                    }

                    let line = if self.partial.is_empty() {
                        std::mem::take(&mut buf)
                    } else {
                        self.partial.extend_from_slice(&buf);
                        std::mem::take(&mut self.partial)
                    };

                    if !Self::handle_line(&line, &mut assembler, &mut callback, &handoff).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    callback(Err(SourceError::Generic {
                        message: format!("reading {}: {}", self.name, e),
                    }));

                    // A followed file gets another chance from a fresh handle
                    if self.follow && self.reopen().await {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.poll_interval) => {}
                        }
                        continue;
                    }
                    return Err(Error::Io(e));
                }
            }
        }

        tracing::info!(source = %self.name, "Audit source stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::handoff;
    use std::sync::{Arc, Mutex};

    const RECORDS: &str = "\
type=SYSCALL msg=audit(1.0:42): auid=1000 uid=1000 exe=\"/bin/ls\"\u{1d}AUID=\"alice\"
type=EXECVE msg=audit(1.0:42): argc=2 a0=\"ls\" a1=\"-la\"
type=EOE msg=audit(1.0:42):
this line is not an audit record
type=USER_LOGIN msg=audit(2.0:43): pid=1 uid=0
type=SYSCALL msg=audit(3.0:44): auid=0 uid=0 exe=\"/usr/bin/id\"
type=EXECVE msg=audit(3.0:44): argc=1 a0=\"id\"
";

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<SourceOutcome>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Box::new(move |outcome| sink.lock().unwrap().push(outcome)), seen)
    }

    #[tokio::test]
    async fn test_stream_reports_events_and_messages() {
        let (tx, mut rx) = handoff::channel(16, OverflowPolicy::Block);
        let (callback, seen) = recorder();
        let source = RecordStreamSource::new(RECORDS.as_bytes(), false, Duration::from_millis(10));

        Box::new(source)
            .run(callback, tx, CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].as_ref().unwrap().serial, 42);
        match &seen[1] {
            Err(SourceError::Parse { raw, .. }) => {
                assert_eq!(raw, "this line is not an audit record")
            }
            other => panic!("expected parse failure, got {:?}", other),
        }
        assert_eq!(seen[2].as_ref().unwrap().serial, 43);
        assert_eq!(seen[3].as_ref().unwrap().serial, 44);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, AuditMessage::new("42", "alice", "/bin/ls", "-la"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.label_key(), "0 /usr/bin/id ");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_follow_mode_stops_on_shutdown() {
        let (tx, _rx) = handoff::channel(1, OverflowPolicy::Block);
        let (callback, _seen) = recorder();
        let source = RecordStreamSource::new(&b""[..], true, Duration::from_millis(5));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(Box::new(source).run(callback, tx, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_mode_flushes_idle_event() {
        let (tx, mut rx) = handoff::channel(4, OverflowPolicy::Block);
        let (callback, seen) = recorder();
        let input = "type=SYSCALL msg=audit(1.0:7): uid=0 exe=\"/bin/true\"\ntype=EXECVE msg=audit(1.0:7): argc=1 a0=\"true\"\n";
        let source = RecordStreamSource::new(input.as_bytes(), true, Duration::from_millis(5));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(Box::new(source).run(callback, tx, shutdown.clone()));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.id, "7");
        assert_eq!(seen.lock().unwrap().len(), 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_handoff_stops_source() {
        let (tx, rx) = handoff::channel(1, OverflowPolicy::Block);
        drop(rx);
        let (callback, _seen) = recorder();
        let source = RecordStreamSource::new(RECORDS.as_bytes(), true, Duration::from_millis(5));

        // Returns without waiting for shutdown
        Box::new(source)
            .run(callback, tx, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let result = RecordStreamSource::open("/nonexistent/audit.log", false, Duration::from_millis(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_undecodable_line_is_skipped() {
        let mut input = b"\xff\xfe not text\n".to_vec();
        input.extend_from_slice(
            b"type=SYSCALL msg=audit(3.0:44): auid=0 uid=0 exe=\"/usr/bin/id\"\n\
              type=EXECVE msg=audit(3.0:44): argc=2 a0=\"id\" a1=\"-u\"\n\
              type=EOE msg=audit(3.0:44):\n",
        );
        let (tx, mut rx) = handoff::channel(4, OverflowPolicy::Block);
        let (callback, seen) = recorder();
        let source = RecordStreamSource::new(std::io::Cursor::new(input), false, Duration::from_millis(5));

        Box::new(source)
            .run(callback, tx, CancellationToken::new())
            .await
            .unwrap();

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            match &seen[0] {
                Err(SourceError::Parse { description, raw }) => {
                    assert!(description.contains("UTF-8"));
                    assert!(raw.ends_with("not text"));
                }
                other => panic!("expected parse failure, got {:?}", other),
            }
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            AuditMessage::new("44", "0", "/usr/bin/id", "-u")
        );
    }

    fn append(path: &std::path::Path, text: &str) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next_message(rx: &mut handoff::HandoffReceiver) -> AuditMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("handoff closed")
    }

    #[tokio::test]
    async fn test_follow_mode_joins_line_written_in_two_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(
            &path,
            "type=SYSCALL msg=audit(3.0:44): auid=0 uid=0 exe=\"/usr/bin/id\"\ntype=EXECVE msg=audit(3.0:44): arg",
        );

        let (tx, mut rx) = handoff::channel(4, OverflowPolicy::Block);
        let (callback, seen) = recorder();
        let source = RecordStreamSource::open(&path, true, Duration::from_millis(5))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Box::new(source).run(callback, tx, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&path, "c=2 a0=\"id\" a1=\"-u\"\ntype=EOE msg=audit(3.0:44):\n");

        let message = next_message(&mut rx).await;
        assert_eq!(message, AuditMessage::new("44", "0", "/usr/bin/id", "-u"));
        assert!(seen.lock().unwrap().iter().all(|outcome| outcome.is_ok()));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_follow_mode_reopens_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(
            &path,
            "type=EXECVE msg=audit(1.0:1): argc=2 a0=\"ls\" a1=\"-a\"\ntype=EOE msg=audit(1.0:1):\n",
        );

        let (tx, mut rx) = handoff::channel(4, OverflowPolicy::Block);
        let (callback, _seen) = recorder();
        let source = RecordStreamSource::open(&path, true, Duration::from_millis(5))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Box::new(source).run(callback, tx, shutdown.clone()));

        assert_eq!(next_message(&mut rx).await.id, "1");

        std::fs::rename(&path, dir.path().join("audit.log.1")).unwrap();
        append(
            &path,
            "type=EXECVE msg=audit(2.0:2): argc=2 a0=\"ls\" a1=\"-b\"\ntype=EOE msg=audit(2.0:2):\n",
        );

        let message = next_message(&mut rx).await;
        assert_eq!(message.id, "2");
        assert_eq!(message.args, "-b");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_mode_restarts_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(
            &path,
            "type=EXECVE msg=audit(1.0:1): argc=3 a0=\"ls\" a1=\"-a\" a2=\"/var/lib/somewhere\"\ntype=EOE msg=audit(1.0:1):\n",
        );

        let (tx, mut rx) = handoff::channel(4, OverflowPolicy::Block);
        let (callback, _seen) = recorder();
        let source = RecordStreamSource::open(&path, true, Duration::from_millis(5))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Box::new(source).run(callback, tx, shutdown.clone()));

        assert_eq!(next_message(&mut rx).await.id, "1");

        std::fs::write(&path, "type=EXECVE msg=audit(2.0:2): argc=1 a0=\"id\"\n").unwrap();

        assert_eq!(next_message(&mut rx).await.id, "2");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::Parse {
            description: "missing record type".to_string(),
            raw: "garbage".to_string(),
        };
        assert_eq!(err.to_string(), "parser error: missing record type");
    }
}
