//! Journal backend fed by a stand-in for `journalctl`.

mod common;

use banwatch::source::{BackendKind, JournalSource, LogSource, SeekPolicy};
use common::{NOW, TestJail};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SSHD: &str = r"Failed password for \S+ from <HOST> port \d+";

fn record(cursor: &str, comm: &str, message: &str, time: f64) -> String {
    json!({
        "__CURSOR": cursor,
        "__REALTIME_TIMESTAMP": format!("{}", (time * 1_000_000.0) as u64),
        "_HOSTNAME": "host",
        "_COMM": comm,
        "_PID": "4242",
        "MESSAGE": message,
    })
    .to_string()
}

/// Script that records its arguments and prints `records`. With `follow`
/// it then stays alive like `journalctl --follow` does.
fn fake_journalctl(dir: &Path, records: &[String], follow: bool) -> std::path::PathBuf {
    let data = dir.join("records.json");
    std::fs::write(&data, records.join("\n") + "\n").unwrap();
    let script = dir.join("journalctl");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$@\" > {}\ncat {}\n{}",
            dir.join("args").display(),
            data.display(),
            if follow { "exec sleep 30\n" } else { "" }
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[tokio::test]
async fn test_records_reach_filter_and_cursor_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let records = vec![
        record("c1", "sshd", "Failed password for root from 192.0.2.40 port 22 ssh2", NOW - 30.0),
        record("c2", "cron", "Failed password for root from 192.0.2.41 port 22 ssh2", NOW - 25.0),
        "not json".to_string(),
        record("c3", "sshd", "Failed password for admin from 192.0.2.40 port 23 ssh2", NOW - 20.0),
        record("c4", "sshd", "Accepted publickey for alice from 192.0.2.42 port 24 ssh2", NOW - 10.0),
    ];
    let program = fake_journalctl(dir.path(), &records, false);
    let cursor_file = dir.path().join("sshd.cursor");

    let mut jail = TestJail::new("sshd");
    jail.filter.add_fail_regex(SSHD).unwrap();
    jail.filter.set_max_retry(2);

    let mut source = JournalSource::new(Some(cursor_file.clone()));
    source.set_program(&program);
    source.set_seek(SeekPolicy::Head);
    source.set_restart_delay(Duration::from_millis(10));
    source.add_match("_COMM=sshd").unwrap();

    let stop = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(5), source.wait()).await.unwrap();
    assert!(!source.backlog_drained());
    // one batch takes every record the reader has ready
    let processed = source.process(&mut jail.filter, &stop).await;
    // the cron record is outside the match, the garbage is an error
    assert_eq!(processed, 3);
    assert!(source.backlog_drained());
    assert_eq!(source.cursor(), Some("c4"));

    let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
    assert!(args.contains("--output=json"));
    assert!(args.contains("--lines=all"));
    assert!(args.trim_end().ends_with("_COMM=sshd"));

    let ticket = jail.fail_manager.to_ban().unwrap();
    assert_eq!(ticket.identity().to_string(), "192.0.2.40");
    assert_eq!(ticket.attempt_count(), 2);
    assert_eq!(ticket.time(), NOW - 20.0);
    assert_eq!(
        ticket.matches()[0],
        "host sshd[4242]: Failed password for root from 192.0.2.40 port 22 ssh2"
    );
    assert_eq!(jail.fail_manager.fail_total(), 2);

    source.close();
    let resumed = JournalSource::new(Some(cursor_file));
    assert_eq!(resumed.cursor(), Some("c4"));
    assert!(resumed.command_args().contains(&"--after-cursor=c4".to_string()));
}

#[tokio::test]
async fn test_whole_backlog_read_in_catch_up() {
    let dir = tempfile::tempdir().unwrap();
    // all older than the find time
    let records: Vec<String> = (0..4_u32)
        .map(|i| {
            let message = format!("Failed password for root from 192.0.2.50 port {i} ssh2");
            record(&format!("c{i}"), "sshd", &message, NOW - 3000.0 + f64::from(i))
        })
        .collect();
    let program = fake_journalctl(dir.path(), &records, true);

    let mut jail = TestJail::new("sshd");
    jail.filter.add_fail_regex(SSHD).unwrap();
    let mut source = LogSource::new(BackendKind::Journal, Duration::from_millis(10)).unwrap();
    let journal = source.journal_mut().unwrap();
    journal.set_program(&program);
    journal.set_seek(SeekPolicy::Head);

    let fail_manager = jail.fail_manager.clone();
    let mut filter = jail.filter;
    let stop = CancellationToken::new();
    let task = tokio::spawn({
        let stop = stop.clone();
        async move {
            source.run(&mut filter, stop).await;
            filter
        }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    stop.cancel();
    let filter = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    // none of the old records was mistaken for a live one
    assert!(filter.in_operation());
    assert_eq!(fail_manager.fail_total(), 0);
}
