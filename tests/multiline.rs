//! Multi-line failures: an anchor line paired with a later confirming line.

mod common;

use common::{NOW, TestJail};

const SENDMAIL: &str = r"sendmail\[(?P<pid>\d+)\]: \w+: from=<[^>]*>, relay=\S*\s*\[<HOST>\]$<SKIPLINES>sendmail\[(?P=pid)\]: \w+: AUTH failure \(\w+\)";

const LOG: [&str; 5] = [
    "Aug 14 11:59:50 mail sendmail[3001]: k1A: from=<a@x.example>, relay=a.example [192.0.2.31]",
    "Aug 14 11:59:51 mail sendmail[3002]: k1B: from=<b@x.example>, relay=[192.0.2.32]",
    "Aug 14 11:59:52 mail sendmail[3001]: k1A: to=<root>, stat=Sent",
    "Aug 14 11:59:53 mail sendmail[3002]: k1B: AUTH failure (LOGIN): authentication failure",
    "Aug 14 11:59:54 mail sendmail[3001]: k1A: AUTH failure (PLAIN): authentication failure",
];

fn jail(max_lines: usize) -> TestJail {
    let mut jail = TestJail::new("sendmail");
    jail.filter.add_fail_regex(SENDMAIL).unwrap();
    jail.filter.set_max_lines(max_lines);
    jail.filter.set_max_retry(1);
    jail
}

#[tokio::test]
async fn test_confirming_line_pairs_with_its_session() {
    let mut jail = jail(10);

    let found = jail.feed(&LOG[..4]).await;
    assert_eq!(found, ["192.0.2.32"]);

    let ticket = jail.fail_manager.to_ban().unwrap();
    assert_eq!(ticket.identity().to_string(), "192.0.2.32");
    assert_eq!(ticket.time(), NOW - 7.0);
    assert_eq!(ticket.matches(), [LOG[1], LOG[3]]);
    assert_eq!(ticket.data().get("pid").map(String::as_str), Some("3002"));

    // the other session is still waiting for its confirmation
    assert_eq!(jail.feed(&LOG[4..]).await, ["192.0.2.31"]);
}

#[tokio::test]
async fn test_anchor_used_once() {
    let mut jail = jail(10);
    assert_eq!(jail.feed(&LOG[..4]).await.len(), 1);
    // a second confirmation for the same session has no anchor left
    assert!(jail.feed(&[LOG[3]]).await.is_empty());
}

#[tokio::test]
async fn test_anchor_outside_window() {
    let mut jail = jail(2);
    // by the confirming line the anchor has been pushed out
    assert!(jail.feed(&LOG[1..4]).await.is_empty());
    assert!(jail.drain_tickets().is_empty());
}

#[tokio::test]
async fn test_ignore_regex_sees_the_pair() {
    let mut jail = jail(10);
    // sessions from this sender are trusted, whatever their relay
    jail.filter
        .add_ignore_regex(r"sendmail\[(?P<pid>\d+)\]: \w+: from=<a@x\.example><SKIPLINES>sendmail\[(?P=pid)\]: \w+: AUTH failure")
        .unwrap();

    assert_eq!(jail.feed(&LOG).await, ["192.0.2.32"]);
    assert_eq!(jail.drain_tickets(), [("192.0.2.32".to_string(), 1)]);
}
