//! RESP Data Types
//!
//! Every RESP2 value starts with a type byte and ends with CRLF:
//!
//! | type          | example                              |
//! |---------------|--------------------------------------|
//! | Simple String | `+OK\r\n`                            |
//! | Error         | `-ERR unknown command\r\n`           |
//! | Integer       | `:1000\r\n`                          |
//! | Bulk String   | `$5\r\nhello\r\n` (null: `$-1\r\n`)  |
//! | Array         | `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`  |

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::fmt::Write as _;

/// The CRLF terminator
pub const CRLF: &[u8] = b"\r\n";

/// Type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A RESP2 value, used for both requests and replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary-safe status line
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// Binary-safe string
    BulkString(Bytes),
    /// Null bulk string or null array
    Null,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Appends the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => put_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => put_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => put_number(buf, prefix::INTEGER, *n),
            RespValue::BulkString(data) => {
                put_number(buf, prefix::BULK_STRING, data.len() as i64);
                buf.reserve(data.len() + CRLF.len());
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Null => put_number(buf, prefix::BULK_STRING, -1),
            RespValue::Array(values) => {
                put_number(buf, prefix::ARRAY, values.len() as i64);
                for value in values {
                    value.encode_into(buf);
                }
            }
        }
    }

    /// The wire encoding as a standalone buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// The text of a simple or UTF-8 bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The raw bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(values) => Some(values),
            _ => None,
        }
    }
}

fn put_line(buf: &mut BytesMut, type_byte: u8, line: &[u8]) {
    buf.reserve(1 + line.len() + CRLF.len());
    buf.put_u8(type_byte);
    buf.put_slice(line);
    buf.put_slice(CRLF);
}

fn put_number(buf: &mut BytesMut, type_byte: u8, n: i64) {
    buf.put_u8(type_byte);
    // Writing into BytesMut never fails.
    let _ = write!(buf, "{}", n);
    buf.put_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "({} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(&RespValue::ok().encode()[..], b"+OK\r\n");
        assert_eq!(
            &RespValue::error("ERR unknown command").encode()[..],
            b"-ERR unknown command\r\n"
        );
        assert_eq!(&RespValue::integer(-42).encode()[..], b":-42\r\n");
        assert_eq!(&RespValue::null().encode()[..], b"$-1\r\n");
    }

    #[test]
    fn test_encode_bulk_string_is_binary_safe() {
        let value = RespValue::bulk_string(Bytes::from_static(b"a\r\nb"));
        assert_eq!(&value.encode()[..], b"$4\r\na\r\nb\r\n");
    }

    #[test]
    fn test_encode_nested_array() {
        let value = RespValue::array(vec![
            RespValue::integer(1),
            RespValue::array(vec![RespValue::bulk_string("x"), RespValue::null()]),
        ]);
        assert_eq!(&value.encode()[..], b"*2\r\n:1\r\n*2\r\n$1\r\nx\r\n$-1\r\n");
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::from(&b"+PONG\r\n"[..]);
        RespValue::integer(7).encode_into(&mut buf);
        assert_eq!(&buf[..], b"+PONG\r\n:7\r\n");
    }

    #[test]
    fn test_display() {
        let value = RespValue::array(vec![RespValue::bulk_string("a"), RespValue::integer(2)]);
        assert_eq!(value.to_string(), "1) \"a\"\n2) (integer) 2");
        assert_eq!(RespValue::null().to_string(), "(nil)");
    }
}
