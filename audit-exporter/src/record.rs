//! Kernel audit text records
//!
//! Parses records in the kernel's text format:
//!
//! ```text
//! node=host type=SYSCALL msg=audit(1364481363.243:24287): arch=c000003e syscall=59 exe="/bin/ls" ...
//! ```
//!
//! Records sharing a serial number are grouped into one [`AuditEvent`], from
//! which an [`AuditMessage`] is derived when the event describes a process
//! execution.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::message::AuditMessage;

/// Record type closing a multi-record event
pub const END_OF_EVENT: &str = "EOE";

/// Kernel value for an unset login uid
const UNSET_ID: &str = "4294967295";

/// String-valued keys the kernel hex-encodes when they contain special characters
const ENCODED_KEYS: &[&str] = &["exe", "comm", "proctitle", "cwd", "name", "cmd", "acct"];

/// One parsed kernel audit record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Record type, e.g. `SYSCALL` or `EXECVE`
    pub record_type: String,
    /// Kernel timestamp
    pub timestamp: DateTime<Utc>,
    /// Event serial number shared by all records of one event
    pub serial: u64,
    /// Originating node, when the record is node-prefixed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Decoded field values
    pub fields: BTreeMap<String, String>,
}

impl AuditRecord {
    /// Look up a decoded field value
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// All records of one kernel audit event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Event serial number
    pub serial: u64,
    /// Timestamp of the first record
    pub timestamp: DateTime<Utc>,
    /// Records in arrival order
    pub records: Vec<AuditRecord>,
}

impl AuditEvent {
    fn from_record(record: AuditRecord) -> Self {
        Self {
            serial: record.serial,
            timestamp: record.timestamp,
            records: vec![record],
        }
    }

    /// First record of the given type
    pub fn record(&self, record_type: &str) -> Option<&AuditRecord> {
        self.records.iter().find(|r| r.record_type == record_type)
    }

    /// Derive the user-facing message for process executions
    ///
    /// Returns `None` for events without an `EXECVE` record. Arguments are
    /// collected from every `EXECVE` record, since the kernel splits long
    /// argument lists across several.
    pub fn to_message(&self) -> Option<AuditMessage> {
        let execves: Vec<&AuditRecord> = self
            .records
            .iter()
            .filter(|r| r.record_type == "EXECVE")
            .collect();
        let first = execves.first()?;
        let syscall = self.record("SYSCALL");

        let user = syscall
            .and_then(|s| {
                s.field("AUID")
                    .filter(|v| *v != "unset")
                    .or_else(|| s.field("auid").filter(|v| *v != UNSET_ID))
                    .or_else(|| s.field("UID"))
                    .or_else(|| s.field("uid"))
            })
            .unwrap_or_default();

        let command = syscall
            .and_then(|s| s.field("exe"))
            .or_else(|| first.field("a0"))
            .unwrap_or_default();

        Some(AuditMessage::new(
            self.serial.to_string(),
            user,
            command,
            execve_args(&execves).join(" "),
        ))
    }
}

/// Arguments after `a0`, reassembling arguments the kernel split into chunks
///
/// Only argument keys actually present are visited; `argc` bounds the result
/// but never drives iteration.
fn execve_args(execves: &[&AuditRecord]) -> Vec<String> {
    let argc = execves
        .iter()
        .find_map(|r| r.field("argc"))
        .and_then(|v| v.parse::<usize>().ok());

    let mut whole: BTreeMap<usize, String> = BTreeMap::new();
    let mut chunked: BTreeMap<usize, BTreeMap<usize, &str>> = BTreeMap::new();

    for record in execves {
        for (key, value) in &record.fields {
            match parse_arg_key(key) {
                Some((index, None)) => {
                    whole.insert(index, value.clone());
                }
                Some((index, Some(chunk))) => {
                    chunked.entry(index).or_default().insert(chunk, value.as_str());
                }
                None => {}
            }
        }
    }

    for (index, chunks) in chunked {
        whole
            .entry(index)
            .or_insert_with(|| chunks.into_values().collect());
    }

    whole
        .into_iter()
        .filter(|(index, _)| *index >= 1 && argc.map_or(true, |argc| *index < argc))
        .map(|(_, value)| value)
        .collect()
}

/// Split `aN` into `(N, None)` and `aN[M]` into `(N, Some(M))`
fn parse_arg_key(key: &str) -> Option<(usize, Option<usize>)> {
    if !is_execve_arg_key(key) {
        return None;
    }
    let rest = &key[1..];
    match rest.split_once('[') {
        Some((index, chunk)) => {
            let chunk = chunk.strip_suffix(']')?.parse().ok()?;
            Some((index.parse().ok()?, Some(chunk)))
        }
        None => Some((rest.parse().ok()?, None)),
    }
}

/// Parse a single text record
///
/// The error is a description of what is malformed; the caller keeps the raw
/// line alongside it.
pub fn parse_record(line: &str) -> Result<AuditRecord, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut rest = line.trim_start();

    let mut node = None;
    if let Some(after) = rest.strip_prefix("node=") {
        let (value, tail) = split_token(after);
        node = Some(value.to_string());
        rest = tail.trim_start();
    }

    let after_type = rest
        .strip_prefix("type=")
        .ok_or_else(|| "missing record type".to_string())?;
    let (record_type, tail) = split_token(after_type);
    if record_type.is_empty() {
        return Err("empty record type".to_string());
    }

    let after_msg = tail
        .trim_start()
        .strip_prefix("msg=audit(")
        .ok_or_else(|| "missing audit(timestamp:serial) header".to_string())?;
    let close = after_msg
        .find(')')
        .ok_or_else(|| "unterminated audit header".to_string())?;
    let (timestamp, serial) = parse_stamp(&after_msg[..close])?;
    let body = after_msg[close + 1..]
        .strip_prefix(':')
        .ok_or_else(|| "missing ':' after audit header".to_string())?;

    let mut fields = BTreeMap::new();
    parse_fields(body, record_type, &mut fields)?;

    Ok(AuditRecord {
        record_type: record_type.to_string(),
        timestamp,
        serial,
        node,
        fields,
    })
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == '\u{1d}'
}

fn split_token(input: &str) -> (&str, &str) {
    match input.find(is_separator) {
        Some(end) => (&input[..end], &input[end..]),
        None => (input, ""),
    }
}

fn parse_stamp(stamp: &str) -> Result<(DateTime<Utc>, u64), String> {
    let (time, serial) = stamp
        .split_once(':')
        .ok_or_else(|| format!("malformed audit header '{}'", stamp))?;
    let serial = serial
        .parse::<u64>()
        .map_err(|_| format!("invalid serial '{}'", serial))?;

    let (secs, frac) = time.split_once('.').unwrap_or((time, "0"));
    let secs = secs
        .parse::<i64>()
        .map_err(|_| format!("invalid timestamp '{}'", time))?;
    if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid timestamp '{}'", time));
    }
    let mut digits: String = frac.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos = digits
        .parse::<u32>()
        .map_err(|_| format!("invalid timestamp '{}'", time))?;

    let timestamp = DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or_else(|| format!("timestamp out of range '{}'", time))?;
    Ok((timestamp, serial))
}

fn parse_fields(
    body: &str,
    record_type: &str,
    fields: &mut BTreeMap<String, String>,
) -> Result<(), String> {
    let mut rest = body;

    loop {
        rest = rest.trim_start_matches(is_separator);
        if rest.is_empty() {
            return Ok(());
        }

        let (token, _) = split_token(rest);
        let Some(eq) = token.find('=') else {
            // Bare words carry no key; skip them
            rest = &rest[token.len()..];
            continue;
        };
        let key = &rest[..eq];
        if key.is_empty() {
            return Err(format!("empty field name in '{}'", token));
        }

        let after = &rest[eq + 1..];
        match after.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let inner = &after[1..];
                let end = inner
                    .find(quote)
                    .ok_or_else(|| format!("unterminated quoted value for '{}'", key))?;
                let value = &inner[..end];
                rest = &inner[end + 1..];

                if quote == '\'' && key == "msg" {
                    // User-space records nest their payload in msg='...'
                    let mut nested = BTreeMap::new();
                    parse_fields(value, record_type, &mut nested)?;
                    for (k, v) in nested {
                        fields.entry(k).or_insert(v);
                    }
                } else {
                    fields.insert(key.to_string(), value.to_string());
                }
            }
            _ => {
                let (value, tail) = split_token(after);
                rest = tail;
                let value = if is_encoded_key(record_type, key) {
                    decode_hex(value).unwrap_or_else(|| value.to_string())
                } else {
                    value.to_string()
                };
                fields.insert(key.to_string(), value);
            }
        }
    }
}

fn is_encoded_key(record_type: &str, key: &str) -> bool {
    if ENCODED_KEYS.contains(&key) {
        return true;
    }
    record_type == "EXECVE" && is_execve_arg_key(key)
}

/// Matches `aN` and `aN[M]`
fn is_execve_arg_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix('a') else {
        return false;
    };
    let (index, chunk) = match rest.split_once('[') {
        Some((index, chunk)) => (index, chunk.strip_suffix(']')),
        None => (rest, Some("0")),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(index) && chunk.is_some_and(all_digits)
}

/// Decode an unquoted hex value; NUL separators become spaces
fn decode_hex(value: &str) -> Option<String> {
    if value.is_empty() || value.len() % 2 != 0 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let bytes = (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;
    let text = String::from_utf8_lossy(&bytes);
    Some(text.trim_end_matches('\0').replace('\0', " "))
}

/// Groups consecutive records into events by serial number
#[derive(Debug, Default)]
pub struct EventAssembler {
    pending: Option<AuditEvent>,
}

impl EventAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, returning an event if this record completed one
    ///
    /// An event completes on its `EOE` record or when a record with a
    /// different serial arrives.
    pub fn push(&mut self, record: AuditRecord) -> Option<AuditEvent> {
        if record.record_type == END_OF_EVENT {
            return self.pending.take();
        }

        match self.pending.as_mut() {
            Some(event) if event.serial == record.serial => {
                event.records.push(record);
                None
            }
            _ => self.pending.replace(AuditEvent::from_record(record)),
        }
    }

    /// Complete and return the event being assembled, if any
    pub fn flush(&mut self) -> Option<AuditEvent> {
        self.pending.take()
    }

    /// Whether an incomplete event is buffered
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
