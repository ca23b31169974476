use std::io::{self, Write};
use std::ops::Range;

use atoi::atoi;
use bytes::BytesMut;

/// Request dialect, detected from the first byte of a fresh frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    Unknown,
    Inline,
    MultiBulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Init,
    /// More bytes are needed; feed the parser again once they arrive.
    Process,
    /// A complete argument vector is available; copy it out and `reset`.
    Success,
    InvalidMultiBulkLength,
    MissingDollarSign,
    InvalidBulkLength,
}

/// Incremental RESP request parser.
///
/// `input` is fed the unconsumed tail of the connection's input buffer and
/// returns how many bytes it consumed. Argument values are recorded as byte
/// ranges into that buffer, counted from the start of the current frame, so
/// the buffer must not be compacted until the frame completes and the argv
/// has been copied out.
#[derive(Debug)]
pub struct RespParser {
    state: ParseState,
    req_type: ReqType,
    /// Bulks left to read in a MultiBulk frame. 0 means the `*` header has
    /// not been read yet.
    multi_bulk_len: i64,
    /// Size of the bulk currently being read, -1 when its `$` header has not
    /// been read yet.
    bulk_len: i64,
    /// Total bytes consumed for the current frame across `input` calls.
    consumed: usize,
    argv: Vec<Range<usize>>,
}

impl RespParser {
    pub fn new() -> RespParser {
        RespParser {
            state: ParseState::Init,
            req_type: ReqType::Unknown,
            multi_bulk_len: 0,
            bulk_len: -1,
            consumed: 0,
            argv: Vec::new(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Argument ranges of the completed frame, relative to the frame start.
    pub fn argv(&self) -> &[Range<usize>] {
        &self.argv
    }

    pub fn reset(&mut self) {
        self.state = ParseState::Init;
        self.req_type = ReqType::Unknown;
        self.multi_bulk_len = 0;
        self.bulk_len = -1;
        self.consumed = 0;
        self.argv.clear();
    }

    /// Feeds `src`, the unconsumed tail of the input buffer, to the parser
    /// and returns the number of bytes consumed. Check `state` afterwards.
    pub fn input(&mut self, src: &[u8]) -> usize {
        let Some(&first) = src.first() else {
            return 0;
        };
        self.state = ParseState::Process;
        if self.req_type == ReqType::Unknown {
            self.req_type = if first == b'*' {
                ReqType::MultiBulk
            } else {
                ReqType::Inline
            };
        }
        let consumed = match self.req_type {
            ReqType::MultiBulk => self.input_multi_bulk(src),
            _ => self.input_inline(src),
        };
        self.consumed += consumed;
        consumed
    }

    /// A single newline-terminated line, split on spaces into argv. An empty
    /// line still yields one empty argument.
    fn input_inline(&mut self, src: &[u8]) -> usize {
        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
            return 0;
        };
        let consumed = pos + 1;

        let mut line_end = pos;
        if line_end > 0 && src[line_end - 1] == b'\r' {
            line_end -= 1;
        }

        let mut start = 0;
        for i in 0..=line_end {
            if i == line_end || src[i] == b' ' {
                self.argv.push(self.consumed + start..self.consumed + i);
                start = i + 1;
            }
        }
        self.state = ParseState::Success;
        consumed
    }

    /// `*<n>\r\n` followed by `n` bulks of the form `$<m>\r\n<m bytes>\r\n`.
    /// Returns partial progress whenever a header line or bulk payload is not
    /// fully buffered yet; `multi_bulk_len`/`bulk_len` carry the resume
    /// point.
    fn input_multi_bulk(&mut self, src: &[u8]) -> usize {
        let mut consumed = 0;

        if self.multi_bulk_len == 0 {
            let Some(pos) = find_crlf(src) else {
                return 0;
            };
            let Some(n) = parse_decimal(&src[1..pos]) else {
                self.state = ParseState::InvalidMultiBulkLength;
                return 0;
            };
            consumed = pos + 2;
            if n <= 0 {
                self.state = ParseState::Success;
                return consumed;
            }
            self.multi_bulk_len = n;
        }

        while self.multi_bulk_len != 0 {
            if self.bulk_len == -1 {
                let rest = &src[consumed..];
                let Some(pos) = find_crlf(rest) else {
                    return consumed;
                };
                let line = &rest[..pos];
                if line.first() != Some(&b'$') {
                    self.state = ParseState::MissingDollarSign;
                    return 0;
                }
                let len = match parse_decimal(&line[1..]) {
                    Some(len) if len >= 0 => len,
                    _ => {
                        self.state = ParseState::InvalidBulkLength;
                        return 0;
                    }
                };
                consumed += pos + 2;
                self.bulk_len = len;
            }

            let rest = &src[consumed..];
            let need = self.bulk_len as usize + 2;
            if rest.len() < need {
                break;
            }
            let begin = self.consumed + consumed;
            self.argv.push(begin..begin + self.bulk_len as usize);
            consumed += need;
            self.bulk_len = -1;
            self.multi_bulk_len -= 1;
        }

        if self.multi_bulk_len == 0 {
            self.state = ParseState::Success;
        }
        consumed
    }
}

impl Default for RespParser {
    fn default() -> Self {
        RespParser::new()
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

/// Strict decimal parse: every byte must be a digit (after an optional
/// leading minus). `atoi` alone would accept trailing garbage.
fn parse_decimal(line: &[u8]) -> Option<i64> {
    let digits = line.strip_prefix(b"-").unwrap_or(line);
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    atoi::<i64>(line)
}

pub fn append_simple_string(buf: &mut BytesMut, s: &[u8]) {
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(s);
    buf.extend_from_slice(b"\r\n");
}

pub fn append_error(buf: &mut BytesMut, s: &[u8]) {
    buf.extend_from_slice(b"-");
    buf.extend_from_slice(s);
    buf.extend_from_slice(b"\r\n");
}

pub fn append_integer(buf: &mut BytesMut, n: i64) {
    buf.extend_from_slice(b":");
    append_decimal(buf, n);
    buf.extend_from_slice(b"\r\n");
}

pub fn append_bulk_string(buf: &mut BytesMut, s: &[u8]) {
    buf.extend_from_slice(b"$");
    append_decimal(buf, s.len() as i64);
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(s);
    buf.extend_from_slice(b"\r\n");
}

pub fn append_null_bulk_string(buf: &mut BytesMut) {
    buf.extend_from_slice(b"$-1\r\n");
}

pub fn append_array_len(buf: &mut BytesMut, n: i64) {
    buf.extend_from_slice(b"*");
    append_decimal(buf, n);
    buf.extend_from_slice(b"\r\n");
}

pub fn append_null_array(buf: &mut BytesMut) {
    buf.extend_from_slice(b"*-1\r\n");
}

fn append_decimal(buf: &mut BytesMut, n: i64) {
    // 20 bytes fit any decimal i64
    let mut tmp = [0u8; 20];
    let mut cursor = io::Cursor::new(&mut tmp[..]);
    let _ = write!(&mut cursor, "{}", n);
    let len = cursor.position() as usize;
    buf.extend_from_slice(&tmp[..len]);
}
