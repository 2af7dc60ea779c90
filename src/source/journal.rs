//! systemd journal backend.
//!
//! Follows `journalctl --output=json` and turns each record into a
//! syslog-style line. The record's own timestamp is used as the event time.
//! The journal cursor is persisted so a restart resumes after the last
//! processed record.

use super::SeekPolicy;
use crate::error::{FilterError, SourceError};
use crate::filter::Filter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const JOURNALCTL: &str = "journalctl";

/// Records processed between two cursor saves.
const CURSOR_SAVE_EVERY: usize = 50;

/// Delay before restarting `journalctl` after it exits or fails to start.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Quiet time after which the pending records count as read.
const BACKLOG_SETTLE: Duration = Duration::from_millis(100);

/// Records handled by one `process` call.
const BATCH_MAX: usize = 1000;

// ============================================================================
// Match groups
// ============================================================================

/// One group of `FIELD=value` terms. Terms on different fields must all
/// hold; terms on the same field are alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalMatch {
    terms: BTreeMap<String, Vec<String>>,
}

impl JournalMatch {
    /// Parse a match spec into its groups, separated by `+`.
    ///
    /// `"_SYSTEMD_UNIT=sshd.service + _COMM=sshd"` gives two groups.
    pub fn parse(spec: &str) -> Result<Vec<JournalMatch>, FilterError> {
        let mut groups = Vec::new();
        let mut current = BTreeMap::<String, Vec<String>>::new();
        for token in spec.split_whitespace() {
            if token == "+" {
                if current.is_empty() {
                    return Err(FilterError::InvalidJournalMatch(spec.to_string()));
                }
                groups.push(JournalMatch {
                    terms: std::mem::take(&mut current),
                });
                continue;
            }
            let (field, value) = token
                .split_once('=')
                .filter(|(f, _)| is_field_name(f))
                .ok_or_else(|| FilterError::InvalidJournalMatch(token.to_string()))?;
            current.entry(field.to_string()).or_default().push(value.to_string());
        }
        if current.is_empty() {
            return Err(FilterError::InvalidJournalMatch(spec.to_string()));
        }
        groups.push(JournalMatch { terms: current });
        Ok(groups)
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        self.terms.iter().all(|(field, values)| {
            field_text(record, field).is_some_and(|v| values.iter().any(|want| *want == v))
        })
    }

    fn args(&self) -> impl Iterator<Item = String> + '_ {
        self.terms
            .iter()
            .flat_map(|(field, values)| values.iter().map(move |v| format!("{field}={v}")))
    }
}

impl fmt::Display for JournalMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.args().collect();
        f.write_str(&terms.join(" "))
    }
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Text of a record field. Binary fields arrive as byte arrays; a field
/// with several values yields the first.
fn field_text(record: &Map<String, Value>, field: &str) -> Option<String> {
    value_text(record.get(field)?)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) if items.iter().all(Value::is_u64) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(Value::as_u64)
                .map(|b| b as u8)
                .collect();
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        Value::Array(items) => items.first().and_then(value_text),
        _ => None,
    }
}

/// Build the line handed to the filter and the record's event time.
///
/// The line reads `HOST IDENT[PID]: MESSAGE`, leaving out the parts the
/// record does not carry.
pub fn format_record(record: &Map<String, Value>) -> Result<(String, f64), SourceError> {
    let message = field_text(record, "MESSAGE")
        .ok_or_else(|| SourceError::Journal("record has no MESSAGE".to_string()))?;
    let time = field_text(record, "__REALTIME_TIMESTAMP")
        .and_then(|usec| usec.parse::<u64>().ok())
        .map(|usec| usec as f64 / 1_000_000.0)
        .ok_or_else(|| SourceError::Journal("record has no valid __REALTIME_TIMESTAMP".to_string()))?;

    let mut parts = Vec::with_capacity(3);
    if let Some(host) = field_text(record, "_HOSTNAME") {
        parts.push(host);
    }
    let ident = field_text(record, "SYSLOG_IDENTIFIER").or_else(|| field_text(record, "_COMM"));
    if let Some(ident) = ident {
        let pid = field_text(record, "SYSLOG_PID").or_else(|| field_text(record, "_PID"));
        parts.push(match pid {
            Some(pid) => format!("{ident}[{pid}]:"),
            None => format!("{ident}:"),
        });
    }
    parts.push(message);
    Ok((parts.join(" "), time))
}

// ============================================================================
// Cursor persistence
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CursorState {
    cursor: String,
}

fn load_cursor(path: &Path) -> Option<String> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read journal cursor");
            return None;
        }
    };
    match serde_json::from_str::<CursorState>(&content) {
        Ok(state) => Some(state.cursor),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed journal cursor file");
            None
        }
    }
}

/// Write the cursor through a temp file and rename it into place.
fn save_cursor(path: &Path, cursor: &str) -> std::io::Result<()> {
    let state = CursorState {
        cursor: cursor.to_string(),
    };
    let json = serde_json::to_vec(&state).map_err(std::io::Error::other)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    debug!(path = %path.display(), "Journal cursor saved");
    Ok(())
}

// ============================================================================
// Source
// ============================================================================

pub struct JournalSource {
    program: PathBuf,
    matches: Vec<JournalMatch>,
    files: Vec<PathBuf>,
    seek: SeekPolicy,
    cursor_file: Option<PathBuf>,
    cursor: Option<String>,
    unsaved: usize,
    restart_delay: Duration,
    child: Option<Child>,
    reader: Option<Lines<BufReader<ChildStdout>>>,
    next: Option<String>,
    /// Set after `journalctl` exited or failed to start.
    stalled: bool,
    /// No record was waiting at the end of the last batch.
    drained: bool,
}

impl fmt::Debug for JournalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalSource")
            .field("program", &self.program)
            .field("matches", &self.matches)
            .field("files", &self.files)
            .field("cursor", &self.cursor)
            .field("running", &self.reader.is_some())
            .finish()
    }
}

impl Default for JournalSource {
    fn default() -> Self {
        Self::new(None)
    }
}

impl JournalSource {
    /// Create a journal source. With a cursor file, a previously saved
    /// cursor is loaded and takes precedence over the seek policy.
    pub fn new(cursor_file: Option<PathBuf>) -> Self {
        let cursor = cursor_file.as_deref().and_then(load_cursor);
        if let Some(c) = &cursor {
            debug!(cursor = %c, "Resuming journal after saved cursor");
        }
        Self {
            program: PathBuf::from(JOURNALCTL),
            matches: Vec::new(),
            files: Vec::new(),
            seek: SeekPolicy::Tail,
            cursor_file,
            cursor,
            unsaved: 0,
            restart_delay: DEFAULT_RESTART_DELAY,
            child: None,
            reader: None,
            next: None,
            stalled: false,
            drained: false,
        }
    }

    /// Use another executable in place of `journalctl`.
    pub fn set_program(&mut self, program: impl Into<PathBuf>) {
        self.program = program.into();
        self.restart();
    }

    pub fn set_restart_delay(&mut self, delay: Duration) {
        self.restart_delay = delay;
    }

    pub fn set_seek(&mut self, seek: SeekPolicy) {
        self.seek = seek;
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Add the match groups of `spec`. Groups are ORed with the existing ones.
    pub fn add_match(&mut self, spec: &str) -> Result<(), FilterError> {
        let groups = JournalMatch::parse(spec)?;
        self.matches.extend(groups);
        self.restart();
        Ok(())
    }

    pub fn clear_matches(&mut self) {
        self.matches.clear();
        self.restart();
    }

    pub fn matches(&self) -> Vec<String> {
        self.matches.iter().map(ToString::to_string).collect()
    }

    /// Read the journal files at `path` instead of the system journal.
    pub fn add_path(&mut self, path: &Path, seek: SeekPolicy) -> Result<bool, SourceError> {
        if self.contains_path(path) {
            return Ok(false);
        }
        fs::metadata(path).map_err(|source| SourceError::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;
        self.files.push(path.to_path_buf());
        self.seek = seek;
        self.restart();
        Ok(true)
    }

    pub fn del_path(&mut self, path: &Path) -> bool {
        let before = self.files.len();
        self.files.retain(|p| p != path);
        let removed = before != self.files.len();
        if removed {
            self.restart();
        }
        removed
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.files.iter().any(|p| p == path)
    }

    pub fn log_paths(&self) -> Vec<PathBuf> {
        self.files.clone()
    }

    /// Arguments passed to `journalctl`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--output=json".to_string(),
            "--follow".to_string(),
            "--no-pager".to_string(),
        ];
        for file in &self.files {
            args.push(format!("--file={}", file.display()));
        }
        match (&self.cursor, self.seek) {
            (Some(cursor), _) => args.push(format!("--after-cursor={cursor}")),
            (None, SeekPolicy::Head) => args.push("--lines=all".to_string()),
            (None, SeekPolicy::Tail) => args.push("--lines=0".to_string()),
            (None, SeekPolicy::Time(t)) => {
                args.push("--lines=all".to_string());
                args.push(format!("--since=@{}", t.floor() as i64));
            }
        }
        for (i, group) in self.matches.iter().enumerate() {
            if i > 0 {
                args.push("+".to_string());
            }
            args.extend(group.args());
        }
        args
    }

    fn restart(&mut self) {
        self.reader = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "journalctl already gone");
            }
        }
    }

    fn start(&mut self) -> Result<(), SourceError> {
        let args = self.command_args();
        debug!(program = %self.program.display(), ?args, "Starting journal reader");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Unavailable {
                path: self.program.clone(),
                source,
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Journal("journalctl has no stdout".to_string()))?;
        self.reader = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }

    /// Wait for the next journal record.
    pub async fn wait(&mut self) {
        if self.next.is_some() {
            return;
        }
        if self.stalled {
            tokio::time::sleep(self.restart_delay).await;
            self.stalled = false;
        }
        if self.reader.is_none() {
            if let Err(e) = self.start() {
                error!(error = %e, "Unable to read the journal");
                self.stalled = true;
                return;
            }
        }
        if let Some(line) = self.next_line().await {
            self.next = Some(line);
        }
    }

    /// Next raw line from `journalctl`. Cancel safe.
    async fn next_line(&mut self) -> Option<String> {
        let reader = self.reader.as_mut()?;
        match reader.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) => {
                warn!("journalctl exited, restarting after {:?}", self.restart_delay);
                self.restart();
                self.stalled = true;
                None
            }
            Err(e) => {
                warn!(error = %e, "Error reading from journalctl");
                self.restart();
                self.stalled = true;
                None
            }
        }
    }

    /// Process the record fetched by [`JournalSource::wait`] and every
    /// record that follows it without a pause.
    pub async fn process(&mut self, filter: &mut Filter, stop: &CancellationToken) -> usize {
        let Some(raw) = self.next.take() else {
            return 0;
        };
        let mut processed = self.handle_record(&raw, filter).await;
        for _ in 1..BATCH_MAX {
            if stop.is_cancelled() {
                return processed;
            }
            match tokio::time::timeout(BACKLOG_SETTLE, self.next_line()).await {
                Ok(Some(raw)) => processed += self.handle_record(&raw, filter).await,
                Ok(None) | Err(_) => {
                    self.drained = true;
                    return processed;
                }
            }
        }
        processed
    }

    /// Whether a batch ended because nothing more was pending.
    pub fn backlog_drained(&self) -> bool {
        self.drained
    }

    /// Feed one raw JSON record to `filter`. Returns 1 if a line was
    /// processed.
    pub async fn handle_record(&mut self, raw: &str, filter: &mut Filter) -> usize {
        let record = match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(record) => record,
            Err(e) => {
                let err = SourceError::Journal(e.to_string());
                filter.record_error(err.error_code(), &err);
                return 0;
            }
        };

        if let Some(cursor) = field_text(&record, "__CURSOR") {
            self.cursor = Some(cursor);
            self.unsaved += 1;
            if self.unsaved >= CURSOR_SAVE_EVERY {
                self.persist_cursor();
            }
        }

        if !self.matches.is_empty() && !self.matches.iter().any(|m| m.matches(&record)) {
            debug!(jail = %filter.jail(), "Journal record outside the match groups");
            return 0;
        }

        match format_record(&record) {
            Ok((line, time)) => {
                filter.process_event(&line, Some(time)).await;
                1
            }
            Err(err) => {
                filter.record_error(err.error_code(), &err);
                0
            }
        }
    }

    /// Save the current cursor, if a cursor file is configured.
    pub fn persist_cursor(&mut self) {
        let (Some(path), Some(cursor)) = (&self.cursor_file, &self.cursor) else {
            return;
        };
        match save_cursor(path, cursor) {
            Ok(()) => self.unsaved = 0,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to save journal cursor"),
        }
    }

    /// Stop `journalctl` and save the cursor.
    pub fn close(&mut self) {
        self.persist_cursor();
        self.restart();
        info!("Journal reader closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_parse_matches() {
        let groups = JournalMatch::parse("_SYSTEMD_UNIT=sshd.service _COMM=sshd + _COMM=dropbear").unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].to_string(), "_COMM=sshd _SYSTEMD_UNIT=sshd.service");

        assert!(JournalMatch::parse("").is_err());
        assert!(JournalMatch::parse("+ _COMM=sshd").is_err());
        assert!(JournalMatch::parse("_COMM=sshd +").is_err());
        assert!(JournalMatch::parse("comm=sshd").is_err());
        assert!(JournalMatch::parse("NOEQUALS").is_err());
    }

    #[test]
    fn test_match_semantics() {
        let group = JournalMatch::parse("_COMM=sshd _COMM=sshd-session _TRANSPORT=syslog").unwrap();
        let group = &group[0];
        assert!(group.matches(&record(serde_json::json!({"_COMM": "sshd-session", "_TRANSPORT": "syslog"}))));
        assert!(!group.matches(&record(serde_json::json!({"_COMM": "sshd"}))));
        assert!(!group.matches(&record(serde_json::json!({"_COMM": "cron", "_TRANSPORT": "syslog"}))));
    }

    #[test]
    fn test_format_record() {
        let rec = record(serde_json::json!({
            "_HOSTNAME": "host",
            "SYSLOG_IDENTIFIER": "sshd",
            "_PID": "1234",
            "MESSAGE": "Failed password for root from 192.0.2.7 port 22 ssh2",
            "__REALTIME_TIMESTAMP": "1124013599500000",
        }));
        let (line, time) = format_record(&rec).unwrap();
        assert_eq!(line, "host sshd[1234]: Failed password for root from 192.0.2.7 port 22 ssh2");
        assert_eq!(time, 1_124_013_599.5);

        let rec = record(serde_json::json!({
            "_COMM": "kernel",
            "MESSAGE": [104, 105],
            "__REALTIME_TIMESTAMP": "1000000",
        }));
        assert_eq!(format_record(&rec).unwrap(), ("kernel: hi".to_string(), 1.0));

        let rec = record(serde_json::json!({"MESSAGE": "x"}));
        assert_eq!(format_record(&rec).unwrap_err().error_code(), "journal_error");
    }

    #[test]
    fn test_command_args() {
        let mut src = JournalSource::new(None);
        src.add_match("_SYSTEMD_UNIT=sshd.service + _COMM=sshd").unwrap();
        assert_eq!(
            src.command_args(),
            vec![
                "--output=json",
                "--follow",
                "--no-pager",
                "--lines=0",
                "_SYSTEMD_UNIT=sshd.service",
                "+",
                "_COMM=sshd",
            ]
        );
        src.set_seek(SeekPolicy::Time(1_124_013_599.9));
        assert!(src.command_args().contains(&"--since=@1124013599".to_string()));
    }

    #[test]
    fn test_cursor_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sshd.cursor");

        let mut src = JournalSource::new(Some(path.clone()));
        assert!(src.cursor().is_none());
        src.cursor = Some("s=abc;i=42".to_string());
        src.close();

        let resumed = JournalSource::new(Some(path.clone()));
        assert_eq!(resumed.cursor(), Some("s=abc;i=42"));
        assert!(resumed.command_args().contains(&"--after-cursor=s=abc;i=42".to_string()));
        assert!(!dir.path().join("sshd.tmp").exists());

        fs::write(&path, "not json").unwrap();
        assert!(JournalSource::new(Some(path)).cursor().is_none());
    }

    #[test]
    fn test_add_missing_journal_file() {
        let mut src = JournalSource::new(None);
        let err = src
            .add_path(Path::new("/nonexistent/system.journal"), SeekPolicy::Head)
            .unwrap_err();
        assert_eq!(err.error_code(), "source_unavailable");
    }
}
