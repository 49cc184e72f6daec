//! RESP Protocol Implementation
//!
//! The wire protocol spoken by kvreactor clients: the Redis Serialization
//! Protocol, version 2.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum and its encoding
//! - `parser`: incremental frame decoder for buffered input
//! - `interpreter`: `RespInterpreter`, the connection-facing
//!   [`ProtocolInterpreter`](crate::network::ProtocolInterpreter)
//!
//! ## Example
//!
//! ```
//! use kvreactor::protocol::{parse_message, RespValue};
//! use bytes::Bytes;
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (value, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//! assert_eq!(value.as_array().map(|a| a.len()), Some(2));
//!
//! let response = RespValue::bulk_string(Bytes::from("kv"));
//! assert_eq!(&response.encode()[..], b"$2\r\nkv\r\n");
//! ```

pub mod interpreter;
pub mod parser;
pub mod types;

pub use interpreter::RespInterpreter;
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
