//! Incremental RESP Parser
//!
//! [`RespParser::parse`] looks at the front of a read buffer and returns
//!
//! - `Ok(Some((value, consumed)))` once a whole frame is buffered,
//! - `Ok(None)` while the frame is still incomplete,
//! - `Err(ParseError)` for bytes that can never become a valid frame.
//!
//! The parser is stateless between calls: an incomplete frame is simply
//! parsed again from the start once more bytes arrived. Frames are either
//! RESP arrays (what client libraries send) or inline commands (what a human
//! types into telnet).

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Structural violation (missing CRLF, nesting too deep, ...)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest accepted bulk string (512 MB, as in Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Deepest accepted array nesting
pub const MAX_NESTING_DEPTH: usize = 32;

/// Longest inline command line
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Frame decoder with configurable limits.
#[derive(Debug, Clone)]
pub struct RespParser {
    max_bulk_size: usize,
    max_depth: usize,
    max_inline_size: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self {
            max_bulk_size: MAX_BULK_SIZE,
            max_depth: MAX_NESTING_DEPTH,
            max_inline_size: MAX_INLINE_SIZE,
        }
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps bulk strings; a connection can never buffer more than its read
    /// limit anyway, so there is no point accepting larger declared lengths.
    pub fn with_max_bulk_size(mut self, max: usize) -> Self {
        self.max_bulk_size = max;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_inline_size(mut self, max: usize) -> Self {
        self.max_inline_size = max;
        self
    }

    /// Parses one frame from the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        match buf.first() {
            None => Ok(None),
            Some(&b) if is_frame_prefix(b) => self.parse_value(buf, 0),
            Some(_) => self.parse_inline(buf),
        }
    }

    fn parse_value(&self, buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
        if !is_frame_prefix(buf[0]) {
            return Err(ParseError::ProtocolError(format!(
                "unexpected type byte {:?}",
                char::from(buf[0])
            )));
        }

        let Some(header_end) = find_crlf(buf) else {
            return Ok(None);
        };
        let header = &buf[1..header_end];
        let after_header = header_end + CRLF.len();

        match buf[0] {
            prefix::SIMPLE_STRING => Ok(Some((
                RespValue::SimpleString(utf8(header)?.to_string()),
                after_header,
            ))),
            prefix::ERROR => Ok(Some((RespValue::Error(utf8(header)?.to_string()), after_header))),
            prefix::INTEGER => Ok(Some((RespValue::Integer(integer(header)?), after_header))),
            prefix::BULK_STRING => self.parse_bulk(buf, integer(header)?, after_header),
            _ => self.parse_array(buf, integer(header)?, after_header, depth),
        }
    }

    fn parse_bulk(
        &self,
        buf: &[u8],
        len: i64,
        start: usize,
    ) -> ParseResult<Option<(RespValue, usize)>> {
        if len == -1 {
            return Ok(Some((RespValue::Null, start)));
        }
        if len < 0 {
            return Err(ParseError::InvalidBulkLength(len));
        }
        let len = len as usize;
        if len > self.max_bulk_size {
            return Err(ParseError::MessageTooLarge {
                size: len,
                max: self.max_bulk_size,
            });
        }

        let end = start + len;
        if buf.len() < end + CRLF.len() {
            return Ok(None);
        }
        if &buf[end..end + CRLF.len()] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }
        Ok(Some((
            RespValue::BulkString(Bytes::copy_from_slice(&buf[start..end])),
            end + CRLF.len(),
        )))
    }

    fn parse_array(
        &self,
        buf: &[u8],
        count: i64,
        start: usize,
        depth: usize,
    ) -> ParseResult<Option<(RespValue, usize)>> {
        if count == -1 {
            return Ok(Some((RespValue::Null, start)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }
        if depth >= self.max_depth {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                self.max_depth
            )));
        }

        // Never trust the declared count for the allocation.
        let mut elements = Vec::with_capacity((count as usize).min(1024));
        let mut consumed = start;
        for _ in 0..count {
            if consumed >= buf.len() {
                return Ok(None);
            }
            match self.parse_value(&buf[consumed..], depth + 1)? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        Ok(Some((RespValue::Array(elements), consumed)))
    }

    /// Parses a whitespace-separated command line ending in CRLF (a bare LF
    /// is accepted too). Blank lines before the command are skipped and
    /// counted as consumed.
    fn parse_inline(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let mut start = 0;
        loop {
            let rest = &buf[start..];
            let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                if rest.len() > self.max_inline_size {
                    return Err(ParseError::MessageTooLarge {
                        size: rest.len(),
                        max: self.max_inline_size,
                    });
                }
                return Ok(None);
            };

            let line = rest[..newline].strip_suffix(b"\r").unwrap_or(&rest[..newline]);
            let args: Vec<RespValue> = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|word| !word.is_empty())
                .map(|word| RespValue::BulkString(Bytes::copy_from_slice(word)))
                .collect();

            start += newline + 1;
            if !args.is_empty() {
                return Ok(Some((RespValue::Array(args), start)));
            }
            match buf.get(start) {
                None => return Ok(None),
                Some(b) if is_frame_prefix(*b) => {
                    return Ok(self
                        .parse_value(&buf[start..], 0)?
                        .map(|(value, used)| (value, start + used)));
                }
                Some(_) => {}
            }
        }
    }
}

fn is_frame_prefix(b: u8) -> bool {
    matches!(
        b,
        prefix::ARRAY | prefix::BULK_STRING | prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER
    )
}

/// Position of the first CRLF.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn utf8(bytes: &[u8]) -> ParseResult<&str> {
    std::str::from_utf8(bytes).map_err(|e| ParseError::InvalidUtf8(e.to_string()))
}

fn integer(bytes: &[u8]) -> ParseResult<i64> {
    let text = utf8(bytes)?;
    text.parse()
        .map_err(|_| ParseError::InvalidInteger(text.to_string()))
}

/// Parses one frame with default limits.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
