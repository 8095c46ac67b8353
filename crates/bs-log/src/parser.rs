// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog line parser.
//!
//! Three dialects are accepted, all starting with `<priority>`:
//!
//! 1. `<pri>2015-06-05T16:13:47Z host tag[pid]: content`, written by the
//!    container runtime;
//! 2. `<pri>May 13 21:10:17 [host] tag[pid]: content` (BSD syslog);
//! 3. `<pri>1 2003-08-24T05:14:15Z host app procid msgid sd content`
//!    (RFC 5424).
//!
//! They are tried in that order by a single byte scanner. Every field of the
//! returned [`RawLogParts`] is a slice of the input buffer, nothing is
//! copied.

use std::borrow::Cow;
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};

use crate::errors::ParseError;

const MONTHS: [&[u8; 3]; 12] = [
    b"Jan", b"Feb", b"Mar", b"Apr", b"May", b"Jun", b"Jul", b"Aug", b"Sep", b"Oct", b"Nov", b"Dec",
];

const MAX_PRIORITY: u16 = 191;
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Structured view of one syslog line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawLogParts {
    pub priority: Bytes,
    pub timestamp: Bytes,
    pub hostname: Bytes,
    pub tag: Bytes,
    pub pid: Bytes,
    /// Suffix of the tag after `/`, or the whole tag when there is none.
    pub container_id: Bytes,
    pub content: Bytes,
    /// The whole line without its trailing line terminator.
    pub raw: Bytes,
    pub with_msg: bool,
    pub with_pid: bool,
}

impl RawLogParts {
    /// Builds the parts of a record that did not come in as a syslog line,
    /// laid out as if it had been written in the runtime dialect.
    #[must_use]
    pub fn from_record(priority: u8, timestamp: &str, container_id: &str, content: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(
            16 + timestamp.len() + container_id.len() + content.len(),
        );
        buf.put_u8(b'<');
        let priority_text = priority.to_string();
        let priority_range = span(&mut buf, priority_text.as_bytes());
        buf.put_slice(b">");
        let timestamp_range = span(&mut buf, timestamp.as_bytes());
        buf.put_slice(b" ");
        let tag_start = buf.len();
        buf.put_slice(b"docker/");
        let id_range = span(&mut buf, container_id.as_bytes());
        let tag_range = tag_start..buf.len();
        buf.put_slice(b": ");
        let content_range = span(&mut buf, content);
        let raw = buf.freeze();
        RawLogParts {
            priority: raw.slice(priority_range),
            timestamp: raw.slice(timestamp_range),
            hostname: Bytes::new(),
            tag: raw.slice(tag_range),
            pid: Bytes::new(),
            container_id: raw.slice(id_range),
            content: raw.slice(content_range),
            raw,
            with_msg: true,
            with_pid: false,
        }
    }

    /// Numeric priority, `None` when it does not fit the syslog range.
    #[must_use]
    pub fn priority_value(&self) -> Option<u8> {
        let value: u16 = std::str::from_utf8(&self.priority).ok()?.parse().ok()?;
        if value > MAX_PRIORITY {
            return None;
        }
        u8::try_from(value).ok()
    }

    /// Syslog severity (0 = emergency, 7 = debug); informational when the
    /// priority is unusable.
    #[must_use]
    pub fn severity(&self) -> u8 {
        self.priority_value().map_or(6, |p| p & 0x07)
    }

    #[must_use]
    pub fn facility(&self) -> u8 {
        self.priority_value().map_or(1, |p| p >> 3)
    }

    #[must_use]
    pub fn content_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Parses the timestamp field. BSD timestamps carry no year nor zone and
    /// are read as UTC in the current year.
    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        let ts = std::str::from_utf8(&self.timestamp).ok()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
            return Some(parsed.with_timezone(&Utc));
        }
        let normalized = ts.split_whitespace().collect::<Vec<_>>().join(" ");
        NaiveDateTime::parse_from_str(
            &format!("{} {normalized}", Utc::now().year()),
            "%Y %b %d %H:%M:%S",
        )
        .ok()
        .map(|naive| naive.and_utc())
    }
}

fn span(buf: &mut BytesMut, data: &[u8]) -> Range<usize> {
    let start = buf.len();
    buf.put_slice(data);
    start..buf.len()
}

/// Field offsets found by the scanner.
#[derive(Default)]
struct Fields {
    timestamp: Range<usize>,
    hostname: Range<usize>,
    tag: Range<usize>,
    pid: Range<usize>,
    content: Range<usize>,
    with_msg: bool,
    with_pid: bool,
}

/// Parses one syslog line. Trailing `\r` and `\n` are ignored.
pub fn parse(line: Bytes) -> Result<RawLogParts, ParseError> {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let raw = line.slice(..end);
    let buf = &raw[..];

    let (priority, body) = scan_priority(buf)?;
    let fields = scan_runtime(buf, body)
        .or_else(|| scan_bsd(buf, body))
        .or_else(|| scan_rfc5424(buf, body))
        .ok_or_else(|| ParseError::new("line matches no known syslog format"))?;

    let container_id = container_id_range(buf, &fields.tag);
    Ok(RawLogParts {
        priority: raw.slice(priority),
        timestamp: raw.slice(fields.timestamp),
        hostname: raw.slice(fields.hostname),
        tag: raw.slice(fields.tag),
        pid: raw.slice(fields.pid),
        container_id: raw.slice(container_id),
        content: raw.slice(fields.content),
        with_msg: fields.with_msg,
        with_pid: fields.with_pid,
        raw,
    })
}

fn scan_priority(buf: &[u8]) -> Result<(Range<usize>, usize), ParseError> {
    if buf.first() != Some(&b'<') {
        return Err(ParseError::new("missing priority"));
    }
    let digits = buf[1..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || digits > 3 {
        return Err(ParseError::new("invalid priority"));
    }
    let close = 1 + digits;
    if buf.get(close) != Some(&b'>') {
        return Err(ParseError::new("unterminated priority"));
    }
    let value = buf[1..close]
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    if value > MAX_PRIORITY {
        return Err(ParseError::new("priority out of range"));
    }
    Ok((1..close, close + 1))
}

/// `RFC3339-ts [hostname] tag[pid]: content`
fn scan_runtime(buf: &[u8], pos: usize) -> Option<Fields> {
    let ts_len = rfc3339_len(&buf[pos..])?;
    let timestamp = pos..pos + ts_len;
    let pos = expect_byte(buf, timestamp.end, b' ')?;
    let mut fields = scan_host_and_tag(buf, pos)?;
    fields.timestamp = timestamp;
    Some(fields)
}

/// `Mon DD HH:MM:SS [hostname] tag[pid]: content`
fn scan_bsd(buf: &[u8], pos: usize) -> Option<Fields> {
    let start = pos;
    let month = buf.get(pos..pos + 3)?;
    if !MONTHS.iter().any(|m| m.as_slice() == month) {
        return None;
    }
    let mut pos = expect_byte(buf, pos + 3, b' ')?;
    if buf.get(pos) == Some(&b' ') {
        pos += 1;
    }
    let day_digits = buf[pos..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if day_digits == 0 || day_digits > 2 {
        return None;
    }
    pos = expect_byte(buf, pos + day_digits, b' ')?;
    let clock = buf.get(pos..pos + 8)?;
    let clock_ok = clock.iter().enumerate().all(|(i, b)| match i {
        2 | 5 => *b == b':',
        _ => b.is_ascii_digit(),
    });
    if !clock_ok {
        return None;
    }
    let timestamp = start..pos + 8;
    pos = expect_byte(buf, timestamp.end, b' ')?;
    let mut fields = scan_host_and_tag(buf, pos)?;
    fields.timestamp = timestamp;
    Some(fields)
}

/// `1 ts hostname app procid msgid sd content`
fn scan_rfc5424(buf: &[u8], pos: usize) -> Option<Fields> {
    let mut pos = expect_byte(buf, pos, b'1')?;
    pos = expect_byte(buf, pos, b' ')?;

    let mut header = [0..0, 0..0, 0..0, 0..0, 0..0];
    for field in &mut header {
        let tok = token(buf, pos);
        if tok.is_empty() {
            return None;
        }
        pos = expect_byte(buf, tok.end, b' ')?;
        *field = tok;
    }
    let [timestamp, hostname, app, procid, _msgid] = header;
    if &buf[timestamp.clone()] != b"-" && rfc3339_len(&buf[timestamp.clone()]) != Some(timestamp.len())
    {
        return None;
    }

    pos = skip_structured_data(buf, pos)?;
    let (content, with_msg) = if pos == buf.len() {
        (pos..pos, false)
    } else {
        let mut start = expect_byte(buf, pos, b' ')?;
        if buf[start..].starts_with(UTF8_BOM) {
            start += UTF8_BOM.len();
        }
        (start..buf.len(), true)
    };

    let with_pid = &buf[procid.clone()] != b"-";
    Some(Fields {
        timestamp,
        hostname,
        tag: app,
        pid: if with_pid { procid } else { 0..0 },
        content,
        with_msg,
        with_pid,
    })
}

/// Scans `[hostname] tag[pid]: content`. The hostname is optional: a first
/// token that already looks like a tag is the tag.
fn scan_host_and_tag(buf: &[u8], mut pos: usize) -> Option<Fields> {
    let first = token(buf, pos);
    let first_bytes = &buf[first.clone()];
    let looks_like_tag = first_bytes.contains(&b'[')
        || first_bytes.ends_with(b":")
        || first.end == buf.len();
    let mut hostname = pos..pos;
    if !looks_like_tag && !first.is_empty() {
        hostname = first.clone();
        pos = first.end + 1;
    }
    let mut fields = scan_tag_section(buf, pos)?;
    fields.hostname = hostname;
    Some(fields)
}

/// Scans `tag[pid]: content` where the pid and the content are optional.
fn scan_tag_section(buf: &[u8], pos: usize) -> Option<Fields> {
    let tag_len = buf[pos..]
        .iter()
        .take_while(|b| !matches!(b, b'[' | b':' | b' '))
        .count();
    if tag_len == 0 {
        return None;
    }
    let tag = pos..pos + tag_len;
    let mut pos = tag.end;

    let mut pid = 0..0;
    let mut with_pid = false;
    if buf.get(pos) == Some(&b'[') {
        let close = buf[pos + 1..].iter().position(|b| *b == b']')? + pos + 1;
        pid = pos + 1..close;
        with_pid = true;
        pos = close + 1;
    }

    let (content, with_msg) = match buf.get(pos) {
        None => (pos..pos, false),
        Some(b':') => {
            let mut start = pos + 1;
            if buf.get(start) == Some(&b' ') {
                start += 1;
            }
            (start..buf.len(), true)
        }
        Some(b' ') => (pos + 1..buf.len(), true),
        Some(_) => return None,
    };

    Some(Fields {
        tag,
        pid,
        content,
        with_msg,
        with_pid,
        ..Fields::default()
    })
}

fn skip_structured_data(buf: &[u8], mut pos: usize) -> Option<usize> {
    match buf.get(pos) {
        Some(b'-') => return Some(pos + 1),
        Some(b'[') => {}
        _ => return None,
    }
    while buf.get(pos) == Some(&b'[') {
        pos += 1;
        let mut in_quotes = false;
        loop {
            match *buf.get(pos)? {
                b'\\' if in_quotes => pos += 1,
                b'"' => in_quotes = !in_quotes,
                b']' if !in_quotes => break,
                _ => {}
            }
            pos += 1;
        }
        pos += 1;
    }
    Some(pos)
}

/// Tag suffix after the first `/` up to `[`, or the whole tag.
fn container_id_range(buf: &[u8], tag: &Range<usize>) -> Range<usize> {
    let tag_bytes = &buf[tag.clone()];
    if let Some(slash) = tag_bytes.iter().position(|b| *b == b'/') {
        let start = tag.start + slash + 1;
        let len = buf[start..tag.end]
            .iter()
            .take_while(|b| **b != b'[')
            .count();
        if len > 0 {
            return start..start + len;
        }
    }
    tag.clone()
}

fn token(buf: &[u8], pos: usize) -> Range<usize> {
    let len = buf[pos..].iter().take_while(|b| **b != b' ').count();
    pos..pos + len
}

fn expect_byte(buf: &[u8], pos: usize, expected: u8) -> Option<usize> {
    (buf.get(pos) == Some(&expected)).then_some(pos + 1)
}

/// Length of the RFC 3339 timestamp at the start of `buf`, if there is one.
fn rfc3339_len(buf: &[u8]) -> Option<usize> {
    const SHAPE: &[u8] = b"dddd-dd-ddTdd:dd:dd";
    if buf.len() < SHAPE.len() {
        return None;
    }
    for (expected, actual) in SHAPE.iter().zip(buf) {
        let ok = match expected {
            b'd' => actual.is_ascii_digit(),
            b'T' => matches!(actual, b'T' | b't'),
            sep => actual == sep,
        };
        if !ok {
            return None;
        }
    }
    let mut pos = SHAPE.len();
    if buf.get(pos) == Some(&b'.') {
        let frac = buf[pos + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if frac == 0 {
            return None;
        }
        pos += 1 + frac;
    }
    match buf.get(pos)? {
        b'Z' | b'z' => Some(pos + 1),
        b'+' | b'-' => {
            let zone = buf.get(pos + 1..pos + 6)?;
            let zone_ok = zone[0].is_ascii_digit()
                && zone[1].is_ascii_digit()
                && zone[2] == b':'
                && zone[3].is_ascii_digit()
                && zone[4].is_ascii_digit();
            zone_ok.then_some(pos + 6)
        }
        _ => None,
    }
}
