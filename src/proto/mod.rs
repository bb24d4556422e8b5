// SPDX-License-Identifier: AGPL-3.0-only

//! Byte-level helpers for picking fields out of raw HTTP traffic.
//!
//! These operate on possibly-incomplete buffers: a captured segment
//! may hold half a header block with no request line in sight, so
//! lookups scan whatever lines are present and never assume a full
//! message.

use memchr::memmem;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Value of the first `name:` header line in `buf`, trimmed of
/// surrounding spaces and tabs. Returns an empty slice when the
/// header is absent. The name match is case-insensitive and anchored
/// to line starts; the scan stops at the blank line terminating the
/// header block.
pub fn header<'a>(buf: &'a [u8], name: &[u8]) -> &'a [u8] {
    let mut start = 0;
    while start < buf.len() {
        let line_end = memmem::find(&buf[start..], CRLF).map_or(buf.len(), |i| start + i);
        let line = &buf[start..line_end];
        if line.is_empty() {
            break;
        }
        if let Some(value) = header_value(line, name) {
            return trim(value);
        }
        start = line_end + CRLF.len();
    }
    &[]
}

/// Payload bytes after the first `\r\n\r\n` in `buf`, empty if the
/// header terminator has not been seen yet.
pub fn body(buf: &[u8]) -> &[u8] {
    memmem::find(buf, HEADER_END).map_or(&[], |i| &buf[i + HEADER_END.len()..])
}

fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name.len() || line[name.len()] != b':' {
        return None;
    }
    line[..name.len()]
        .eq_ignore_ascii_case(name)
        .then(|| &line[name.len() + 1..])
}

fn trim(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] =
        b"POST /u HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn header_returns_trimmed_value() {
        assert_eq!(header(REQUEST, b"Content-Length"), b"5");
        assert_eq!(header(REQUEST, b"Host"), b"example.test");
    }

    #[test]
    fn header_name_match_is_case_insensitive() {
        assert_eq!(header(REQUEST, b"content-length"), b"5");
        assert_eq!(header(REQUEST, b"HOST"), b"example.test");
    }

    #[test]
    fn header_absent_yields_empty_slice() {
        assert_eq!(header(REQUEST, b"Transfer-Encoding"), b"");
    }

    #[test]
    fn header_does_not_look_past_the_blank_line() {
        let buf = b"GET / HTTP/1.1\r\n\r\nX-Hidden: body\r\n";
        assert_eq!(header(buf, b"X-Hidden"), b"");
    }

    #[test]
    fn header_works_on_a_continuation_fragment() {
        // A mid-message segment with no request line at all.
        let buf = b"Content-Type: text/plain\r\nExpect: 100-continue\r\n\r\n";
        assert_eq!(header(buf, b"Expect"), b"100-continue");
    }

    #[test]
    fn header_value_whitespace_is_stripped() {
        let buf = b"Host: \t spaced.test \r\n\r\n";
        assert_eq!(header(buf, b"Host"), b"spaced.test");
    }

    #[test]
    fn header_name_prefix_does_not_match() {
        let buf = b"Content-Length-Extra: 9\r\n\r\n";
        assert_eq!(header(buf, b"Content-Length"), b"");
    }

    #[test]
    fn body_follows_the_header_terminator() {
        assert_eq!(body(REQUEST), b"hello");
        assert_eq!(body(b"GET / HTTP/1.1\r\nHost: x\r\n"), b"");
        assert_eq!(body(b"GET / HTTP/1.1\r\n\r\n"), b"");
    }
}
