//! Failure regex templates and the two-phase multi-line matcher.
//!
//! Patterns are written with tags that expand to named groups:
//!
//! - `<HOST>`: IP address or host name, group `host`
//! - `<ADDR>`: IP address only, group `addr`
//! - `<F-NAME>...</F-NAME>`: named capture reported as `F-NAME`
//! - `<F-USER>` (unclosed): shorthand for `<F-USER>\S+</F-USER>`
//! - `<SKIPLINES>`: splits the pattern into an anchor phase and a
//!   confirmation phase matched against a later line
//!
//! `(?P=name)` is not supported by the regex engine. It is compiled to a
//! capture of the referenced group's sub-pattern and the two captured values
//! are compared after matching.

use super::buffer::LineBuffer;
use crate::error::FilterError;
use regex::{Captures, Regex};
use std::collections::HashMap;

pub const HOST_GROUP: &str = "host";
pub const ADDR_GROUP: &str = "addr";
pub const ID_GROUP: &str = "F-ID";
pub const USER_GROUP: &str = "F-USER";

const SKIPLINES: &str = "<SKIPLINES>";
const BACKREF_PREFIX: &str = "__bref";

const RE_IPV4: &str = r"(?:\d{1,3}\.){3}\d{1,3}";
const RE_IPV6: &str = r"\[?[0-9a-fA-F]{0,4}(?::[0-9a-fA-F]{0,4}){2,7}\]?";
const RE_MAPPED_PREFIX: &str = r"(?:::f{4,6}:)?";
const RE_HOSTNAME: &str = r"[\w\-.^_]*\w";
const RE_USER_TOKEN: &str = r"\S+";

fn host_pattern() -> String {
    format!("{RE_MAPPED_PREFIX}(?P<{HOST_GROUP}>{RE_IPV4}|{RE_IPV6}|{RE_HOSTNAME})")
}

fn addr_pattern() -> String {
    format!("{RE_MAPPED_PREFIX}(?P<{ADDR_GROUP}>{RE_IPV4}|{RE_IPV6})")
}

/// Turn named groups into non-capturing ones.
fn strip_group_names(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(pos) = rest.find("(?") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let name_start = after
            .strip_prefix("P<")
            .or_else(|| after.strip_prefix('<').filter(|a| !a.starts_with(['=', '!'])));
        match name_start.and_then(|n| n.find('>').map(|end| (n, end))) {
            Some((n, end)) => {
                out.push_str("(?:");
                rest = &n[end + 1..];
            }
            None => {
                out.push_str("(?");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Group name used in the compiled regex for a tag or user group.
fn group_name(tag: &str) -> String {
    tag.replace('-', "_")
}

/// Name reported to callers for a compiled group.
fn public_name(group: &str) -> String {
    if group.starts_with("F_") {
        group.replace('_', "-")
    } else {
        group.to_string()
    }
}

/// Expand `<HOST>`, `<ADDR>` and `<F-*>` tags.
pub fn expand_tags(pattern: &str) -> String {
    let mut out = pattern
        .replace("<HOST>", &host_pattern())
        .replace("<ADDR>", &addr_pattern());

    let mut search_from = 0;
    while let Some(rel) = out[search_from..].find("<F-") {
        let start = search_from + rel;
        let Some(close_rel) = out[start..].find('>') else {
            break;
        };
        let end = start + close_rel + 1;
        let tag = &out[start + 1..end - 1];
        if tag.is_empty()
            || !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            search_from = end;
            continue;
        }
        let group = group_name(tag);
        let closing = format!("</{tag}>");
        let replaced = match out[end..].find(&closing) {
            Some(close_rel) => {
                let close_start = end + close_rel;
                format!(
                    "{}(?P<{group}>{}){}",
                    &out[..start],
                    &out[end..close_start],
                    &out[close_start + closing.len()..]
                )
            }
            None => format!("{}(?P<{group}>{RE_USER_TOKEN}){}", &out[..start], &out[end..]),
        };
        search_from = start + 1;
        out = replaced;
    }
    out
}

/// Sub-pattern of group `name` as written in `pattern`.
fn group_body(pattern: &str, name: &str) -> Option<String> {
    let open = [format!("(?P<{name}>"), format!("(?<{name}>")]
        .into_iter()
        .find_map(|o| pattern.find(&o).map(|i| i + o.len()))?;
    let mut depth = 1usize;
    let mut in_class = false;
    let mut escaped = false;
    for (i, c) in pattern[open..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => {
                depth -= 1;
                if depth == 0 {
                    let body = &pattern[open..open + i];
                    return Some(strip_group_names(body));
                }
            }
            _ => {}
        }
    }
    None
}

/// A `(?P=name)` compiled as its own capture group.
#[derive(Debug, Clone)]
struct BackRef {
    group: String,
    target: String,
}

/// Replace back-references in `text` with captures of the referenced
/// sub-pattern, looked up in `context`.
fn compile_backrefs(
    text: &str,
    context: &str,
    pattern: &str,
    refs: &mut Vec<BackRef>,
) -> Result<String, FilterError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("(?P=") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 4..];
        let Some(close) = after.find(')') else {
            out.push_str(&rest[pos..]);
            rest = "";
            break;
        };
        let target = &after[..close];
        let scope = format!("{context}{out}");
        let body = group_body(&scope, target).ok_or_else(|| FilterError::UnknownBackReference {
            pattern: pattern.to_string(),
            group: target.to_string(),
        })?;
        let group = format!("{BACKREF_PREFIX}{}_{target}", refs.len());
        out.push_str(&format!("(?P<{group}>{body})"));
        refs.push(BackRef {
            group,
            target: target.to_string(),
        });
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn compile(expr: &str, pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(expr).map_err(|source| FilterError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

fn has_identity(re: &Regex) -> bool {
    let wanted = [HOST_GROUP, ADDR_GROUP, "F_ID", "F_USER"];
    re.capture_names()
        .flatten()
        .any(|name| wanted.contains(&name))
}

/// Back-references hold when every reference equals its target, searched
/// first in `own` then in `other`.
fn backrefs_hold(refs: &[BackRef], own: &Captures<'_>, other: Option<&Captures<'_>>) -> bool {
    refs.iter().all(|r| {
        let value = own.name(&r.group).map(|m| m.as_str());
        let target = own
            .name(&r.target)
            .or_else(|| other.and_then(|c| c.name(&r.target)))
            .map(|m| m.as_str());
        value.is_some() && value == target
    })
}

fn collect_groups(re: &Regex, caps: &Captures<'_>, groups: &mut HashMap<String, String>) {
    for name in re.capture_names().flatten() {
        if name.starts_with(BACKREF_PREFIX) {
            continue;
        }
        if let Some(m) = caps.name(name) {
            groups
                .entry(public_name(name))
                .or_insert_with(|| m.as_str().to_string());
        }
    }
}

/// Result of a successful fail-regex match.
#[derive(Debug, Clone, PartialEq)]
pub struct RegexMatch {
    /// Named captures; `F-*` tags keep their dashed names.
    pub groups: HashMap<String, String>,
    /// Buffer index of the anchor line of a multi-line match.
    pub anchor: Option<usize>,
}

/// One regex, or an anchor/confirmation pair split at `<SKIPLINES>`.
#[derive(Debug, Clone)]
struct LinePair {
    first: Regex,
    first_refs: Vec<BackRef>,
    second: Option<(Regex, Vec<BackRef>)>,
}

impl LinePair {
    fn new(expanded: &str, pattern: &str) -> Result<Self, FilterError> {
        let (head, tail) = match expanded.split_once(SKIPLINES) {
            Some((head, tail)) => (head, Some(tail)),
            None => (expanded, None),
        };

        let mut first_refs = Vec::new();
        let head = compile_backrefs(head, "", pattern, &mut first_refs)?;
        let first = compile(&head, pattern)?;

        let second = match tail {
            Some(tail) => {
                let mut refs = Vec::new();
                let tail = compile_backrefs(tail, &head, pattern, &mut refs)?;
                Some((compile(&tail, pattern)?, refs))
            }
            None => None,
        };
        Ok(Self {
            first,
            first_refs,
            second,
        })
    }

    fn has_identity(&self) -> bool {
        has_identity(&self.first) || self.second.as_ref().is_some_and(|(re, _)| has_identity(re))
    }

    /// Match against the newest buffered line, pairing it with an earlier
    /// anchor line when split.
    fn match_buffer(&self, buffer: &LineBuffer) -> Option<RegexMatch> {
        let current = buffer.last()?;
        let Some((second, second_refs)) = &self.second else {
            let caps = self.first.captures(&current.text)?;
            if !backrefs_hold(&self.first_refs, &caps, None) {
                return None;
            }
            let mut groups = HashMap::new();
            collect_groups(&self.first, &caps, &mut groups);
            return Some(RegexMatch {
                groups,
                anchor: None,
            });
        };

        let confirm = second.captures(&current.text)?;
        (0..buffer.len().saturating_sub(1)).rev().find_map(|idx| {
            let anchor = buffer.get(idx)?;
            let caps = self.first.captures(&anchor.text)?;
            if !backrefs_hold(&self.first_refs, &caps, None)
                || !backrefs_hold(second_refs, &confirm, Some(&caps))
            {
                return None;
            }
            let mut groups = HashMap::new();
            collect_groups(&self.first, &caps, &mut groups);
            collect_groups(second, &confirm, &mut groups);
            Some(RegexMatch {
                groups,
                anchor: Some(idx),
            })
        })
    }
}

/// A compiled failure regex.
#[derive(Debug, Clone)]
pub struct FailRegex {
    pattern: String,
    pair: LinePair,
}

impl FailRegex {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let pair = LinePair::new(&expand_tags(pattern), pattern)?;
        if !pair.has_identity() {
            return Err(FilterError::NoIdentityGroup(pattern.to_string()));
        }
        Ok(Self {
            pattern: pattern.to_string(),
            pair,
        })
    }

    /// The pattern as configured.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_multi_line(&self) -> bool {
        self.pair.second.is_some()
    }

    /// Match against the newest buffered line, pairing it with an earlier
    /// anchor line for multi-line patterns.
    pub fn match_buffer(&self, buffer: &LineBuffer) -> Option<RegexMatch> {
        self.pair.match_buffer(buffer)
    }
}

/// A compiled ignore regex. Sees the same window as the fail regexes.
#[derive(Debug, Clone)]
pub struct IgnoreRegex {
    pattern: String,
    pair: LinePair,
}

impl IgnoreRegex {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        Ok(Self {
            pattern: pattern.to_string(),
            pair: LinePair::new(&expand_tags(pattern), pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, buffer: &LineBuffer) -> bool {
        self.pair.match_buffer(buffer).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::buffer::BufferedLine;

    const RSYNC: &str = r"^.*rsyncd\[(?P<pid>\d+)\]: connect from .+ \(<HOST>\)$<SKIPLINES>^.+ rsyncd\[(?P=pid)\]: rsync error: .*$";

    fn buffer(lines: &[&str]) -> LineBuffer {
        let mut buf = LineBuffer::new(100);
        for (i, l) in lines.iter().enumerate() {
            buf.push(BufferedLine {
                text: l.to_string(),
                line: l.to_string(),
                time: i as f64,
            });
        }
        buf
    }

    fn single(pattern: &str, line: &str) -> Option<HashMap<String, String>> {
        FailRegex::new(pattern)
            .unwrap()
            .match_buffer(&buffer(&[line]))
            .map(|m| m.groups)
    }

    #[test]
    fn test_host_tag() {
        let re = r"Authentication failure for .* from <HOST>$";
        let g = single(re, " [sshd] error: PAM: Authentication failure for kevin from 193.168.0.128").unwrap();
        assert_eq!(g["host"], "193.168.0.128");
        let g = single(re, "x Authentication failure for a from ::ffff:10.0.0.1").unwrap();
        assert_eq!(g["host"], "10.0.0.1");
        let g = single(re, "x Authentication failure for a from 2001:db8::1").unwrap();
        assert_eq!(g["host"], "2001:db8::1");
        let g = single(re, "x Authentication failure for a from example.com").unwrap();
        assert_eq!(g["host"], "example.com");
    }

    #[test]
    fn test_addr_tag_rejects_names() {
        assert!(single(r"from <ADDR>$", "x from example.com").is_none());
        assert_eq!(single(r"from <ADDR>$", "x from 192.0.2.7").unwrap()["addr"], "192.0.2.7");
    }

    #[test]
    fn test_f_tags() {
        let g = single(r"user <F-USER> from <HOST>", "user kevin from 192.0.2.1").unwrap();
        assert_eq!(g["F-USER"], "kevin");
        let g = single(r"session <F-ID>\d+</F-ID> closed", "session 4711 closed").unwrap();
        assert_eq!(g["F-ID"], "4711");
    }

    #[test]
    fn test_identity_required() {
        assert!(matches!(
            FailRegex::new(r"^failure$"),
            Err(FilterError::NoIdentityGroup(_))
        ));
        assert!(matches!(
            FailRegex::new(r"from <HOST> (unclosed"),
            Err(FilterError::InvalidRegex { .. })
        ));
        assert!(matches!(
            FailRegex::new(r"from <HOST>$<SKIPLINES>id (?P=nope)"),
            Err(FilterError::UnknownBackReference { .. })
        ));
    }

    #[test]
    fn test_single_line_backref() {
        let re = r"(?P<w>\w+) again (?P=w) from <HOST>";
        assert!(single(re, "foo again foo from 192.0.2.1").is_some());
        assert!(single(re, "foo again bar from 192.0.2.1").is_none());
    }

    #[test]
    fn test_group_body() {
        let p = r"x (?P<pid>\d+(?:[)(]\))?) y";
        assert_eq!(group_body(p, "pid").unwrap(), r"\d+(?:[)(]\))?");
        assert_eq!(group_body(r"(?P<a>(?P<b>\d))", "a").unwrap(), r"(?:\d)");
        assert!(group_body(p, "missing").is_none());
    }

    #[test]
    fn test_multi_line_correlation() {
        let re = FailRegex::new(RSYNC).unwrap();
        assert!(re.is_multi_line());
        let buf = buffer(&[
            " host rsyncd[1]: connect from a.example (192.0.43.10)",
            " host rsyncd[2]: connect from b.example (192.0.43.11)",
            " host rsyncd[3]: some noise",
            " host rsyncd[2]: rsync error: auth failed",
        ]);
        let m = re.match_buffer(&buf).unwrap();
        assert_eq!(m.groups["host"], "192.0.43.11");
        assert_eq!(m.groups["pid"], "2");
        assert_eq!(m.anchor, Some(1));

        // no anchor with the same pid
        let buf = buffer(&[
            " host rsyncd[1]: connect from a.example (192.0.43.10)",
            " host rsyncd[9]: rsync error: auth failed",
        ]);
        assert!(re.match_buffer(&buf).is_none());

        // the confirming line alone never matches
        let buf = buffer(&[" host rsyncd[1]: rsync error: auth failed"]);
        assert!(re.match_buffer(&buf).is_none());
    }

    #[test]
    fn test_ignore_regex() {
        let re = IgnoreRegex::new("rsync error: Received SIGINT").unwrap();
        assert!(re.is_match(&buffer(&["rsyncd[1]: rsync error: Received SIGINT at io.c"])));
        assert!(!re.is_match(&buffer(&["rsyncd[1]: rsync error: auth failed"])));
        assert!(IgnoreRegex::new("(").is_err());
    }

    #[test]
    fn test_ignore_regex_spans_window() {
        let re = IgnoreRegex::new(
            r"rsyncd\[(?P<pid>\d+)\]: connect from trusted\.example<SKIPLINES>rsyncd\[(?P=pid)\]: rsync error",
        )
        .unwrap();
        let paired = buffer(&[
            " host rsyncd[7]: connect from trusted.example (192.0.2.1)",
            " host rsyncd[8]: connect from other.example (192.0.2.2)",
            " host rsyncd[7]: rsync error: auth failed",
        ]);
        assert!(re.is_match(&paired));

        // the error belongs to the other session
        let unpaired = buffer(&[
            " host rsyncd[7]: connect from trusted.example (192.0.2.1)",
            " host rsyncd[8]: rsync error: auth failed",
        ]);
        assert!(!re.is_match(&unpaired));
    }
}
