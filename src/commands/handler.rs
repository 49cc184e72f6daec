//! Command Semantics
//!
//! [`CommandHandler::execute`] takes a decoded request (an array of bulk
//! strings) and returns the reply. It never fails: every problem becomes a
//! RESP error reply.
//!
//! ## Supported Commands
//!
//! | group  | commands |
//! |--------|----------|
//! | string | `GET`, `SET key value [EX s \| PX ms] [NX \| XX]`, `APPEND`, `STRLEN`, `MGET`, `MSET` |
//! | counter| `INCR`, `INCRBY`, `DECR`, `DECRBY` |
//! | key    | `DEL`, `EXISTS`, `EXPIRE`, `PEXPIRE`, `TTL`, `PTTL`, `PERSIST`, `KEYS` |
//! | server | `PING`, `ECHO`, `DBSIZE`, `FLUSHDB`, `FLUSHALL`, `INFO`, `TIME`, `COMMAND`, `DEBUG SLEEP`, `QUIT` |

use crate::protocol::RespValue;
use crate::storage::{SetCondition, SetOptions, StorageEngine, StorageError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Every command name `COMMAND` reports.
const COMMAND_NAMES: &[&str] = &[
    "GET", "SET", "APPEND", "STRLEN", "MGET", "MSET", "INCR", "INCRBY", "DECR", "DECRBY", "DEL",
    "EXISTS", "EXPIRE", "PEXPIRE", "TTL", "PTTL", "PERSIST", "KEYS", "PING", "ECHO", "DBSIZE",
    "FLUSHDB", "FLUSHALL", "INFO", "TIME", "COMMAND", "DEBUG", "QUIT",
];

/// Why a command was rejected. The message is the error reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR invalid command format")]
    Format,

    #[error("ERR unknown command '{0}'")]
    Unknown(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(&'static str),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),

    #[error("ERR {0}")]
    Storage(#[from] StorageError),
}

type CommandResult = Result<RespValue, CommandError>;

/// Extracts the upper-cased command name of a request.
pub fn command_name(request: &RespValue) -> Option<String> {
    request
        .as_array()?
        .first()?
        .as_str()
        .map(|name| name.to_ascii_uppercase())
}

/// Executes commands against the storage engine.
#[derive(Debug)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    start_time: Instant,
    commands_processed: AtomicU64,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self {
            storage,
            start_time: Instant::now(),
            commands_processed: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    /// Executes one request and returns its reply.
    pub fn execute(&self, request: RespValue) -> RespValue {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        match self.try_execute(request) {
            Ok(reply) => reply,
            Err(e) => RespValue::error(e.to_string()),
        }
    }

    fn try_execute(&self, request: RespValue) -> CommandResult {
        let args = request.into_array().ok_or(CommandError::Format)?;
        let (name, args) = args.split_first().ok_or(CommandError::Format)?;
        let name = name
            .as_str()
            .ok_or(CommandError::Format)?
            .to_ascii_uppercase();

        match name.as_str() {
            "GET" => self.get(args),
            "SET" => self.set(args),
            "APPEND" => self.append(args),
            "STRLEN" => self.strlen(args),
            "MGET" => self.mget(args),
            "MSET" => self.mset(args),
            "INCR" => self.incr_by("INCR", args, 1, false),
            "DECR" => self.incr_by("DECR", args, -1, false),
            "INCRBY" => self.incr_by("INCRBY", args, 1, true),
            "DECRBY" => self.incr_by("DECRBY", args, -1, true),
            "DEL" => self.del(args),
            "EXISTS" => self.exists(args),
            "EXPIRE" => self.expire("EXPIRE", args, Duration::from_secs),
            "PEXPIRE" => self.expire("PEXPIRE", args, Duration::from_millis),
            "TTL" => self.ttl("TTL", args, |ms| (ms + 500) / 1000),
            "PTTL" => self.ttl("PTTL", args, |ms| ms),
            "PERSIST" => self.persist(args),
            "KEYS" => self.keys(args),
            "PING" => self.ping(args),
            "ECHO" => self.echo(args),
            "DBSIZE" => Ok(RespValue::integer(self.storage.len() as i64)),
            "FLUSHDB" | "FLUSHALL" => {
                self.storage.flush();
                Ok(RespValue::ok())
            }
            "INFO" => Ok(self.info()),
            "TIME" => Ok(time()),
            "COMMAND" => Ok(RespValue::array(
                COMMAND_NAMES
                    .iter()
                    .map(|name| RespValue::bulk_string(*name))
                    .collect(),
            )),
            "DEBUG" => self.debug(args),
            "QUIT" => Ok(RespValue::ok()),
            _ => Err(CommandError::Unknown(name.clone())),
        }
    }

    fn get(&self, args: &[RespValue]) -> CommandResult {
        let [key] = exact::<1>("GET", args)?;
        Ok(self
            .storage
            .get(bytes(key)?)
            .map_or_else(RespValue::null, RespValue::bulk_string))
    }

    /// SET key value [EX seconds | PX milliseconds] [NX | XX]
    fn set(&self, args: &[RespValue]) -> CommandResult {
        if args.len() < 2 {
            return Err(CommandError::Arity("SET"));
        }
        let key = owned_bytes(&args[0])?;
        let value = owned_bytes(&args[1])?;

        let mut options = SetOptions::default();
        let mut rest = args[2..].iter();
        while let Some(opt) = rest.next() {
            let opt = opt.as_str().ok_or(CommandError::Syntax)?.to_ascii_uppercase();
            match opt.as_str() {
                "EX" | "PX" if options.ttl.is_none() => {
                    let amount = rest.next().ok_or(CommandError::Syntax)?;
                    let amount = positive(integer(amount)?, "SET")?;
                    options.ttl = Some(if opt == "EX" {
                        Duration::from_secs(amount)
                    } else {
                        Duration::from_millis(amount)
                    });
                }
                "NX" if options.condition == SetCondition::Always => {
                    options.condition = SetCondition::IfAbsent;
                }
                "XX" if options.condition == SetCondition::Always => {
                    options.condition = SetCondition::IfPresent;
                }
                _ => return Err(CommandError::Syntax),
            }
        }

        if self.storage.set_with_options(key, value, options) {
            Ok(RespValue::ok())
        } else {
            Ok(RespValue::null())
        }
    }

    fn append(&self, args: &[RespValue]) -> CommandResult {
        let [key, suffix] = exact::<2>("APPEND", args)?;
        let len = self.storage.append(&owned_bytes(key)?, bytes(suffix)?);
        Ok(RespValue::integer(len as i64))
    }

    fn strlen(&self, args: &[RespValue]) -> CommandResult {
        let [key] = exact::<1>("STRLEN", args)?;
        Ok(RespValue::integer(self.storage.strlen(bytes(key)?) as i64))
    }

    fn mget(&self, args: &[RespValue]) -> CommandResult {
        if args.is_empty() {
            return Err(CommandError::Arity("MGET"));
        }
        let values = args
            .iter()
            .map(|key| {
                bytes(key)
                    .ok()
                    .and_then(|key| self.storage.get(key))
                    .map_or_else(RespValue::null, RespValue::bulk_string)
            })
            .collect();
        Ok(RespValue::array(values))
    }

    fn mset(&self, args: &[RespValue]) -> CommandResult {
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(CommandError::Arity("MSET"));
        }
        let pairs = args
            .chunks_exact(2)
            .map(|pair| -> Result<(Bytes, Bytes), CommandError> {
                Ok((owned_bytes(&pair[0])?, owned_bytes(&pair[1])?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (key, value) in pairs {
            self.storage.set(key, value);
        }
        Ok(RespValue::ok())
    }

    /// INCR/DECR (`explicit == false`) and INCRBY/DECRBY.
    fn incr_by(
        &self,
        name: &'static str,
        args: &[RespValue],
        sign: i64,
        explicit: bool,
    ) -> CommandResult {
        let (key, delta) = if explicit {
            let [key, delta] = exact::<2>(name, args)?;
            (key, integer(delta)?)
        } else {
            let [key] = exact::<1>(name, args)?;
            (key, 1)
        };
        let delta = delta.checked_mul(sign).ok_or(CommandError::NotAnInteger)?;
        let next = self.storage.incr_by(&owned_bytes(key)?, delta)?;
        Ok(RespValue::integer(next))
    }

    fn del(&self, args: &[RespValue]) -> CommandResult {
        if args.is_empty() {
            return Err(CommandError::Arity("DEL"));
        }
        let keys = args.iter().map(owned_bytes).collect::<Result<Vec<_>, _>>()?;
        Ok(RespValue::integer(self.storage.delete_many(&keys) as i64))
    }

    fn exists(&self, args: &[RespValue]) -> CommandResult {
        if args.is_empty() {
            return Err(CommandError::Arity("EXISTS"));
        }
        let keys = args.iter().map(owned_bytes).collect::<Result<Vec<_>, _>>()?;
        Ok(RespValue::integer(self.storage.exists_many(&keys) as i64))
    }

    /// EXPIRE/PEXPIRE. A non-positive timeout deletes the key.
    fn expire(
        &self,
        name: &'static str,
        args: &[RespValue],
        unit: fn(u64) -> Duration,
    ) -> CommandResult {
        let [key, amount] = exact::<2>(name, args)?;
        let key = bytes(key)?;
        let amount = integer(amount)?;

        let applied = if amount <= 0 {
            self.storage.delete(key)
        } else {
            self.storage.expire(key, unit(amount as u64))
        };
        Ok(RespValue::integer(applied as i64))
    }

    /// TTL/PTTL: -2 for a missing key, -1 for a persistent one.
    fn ttl(&self, name: &'static str, args: &[RespValue], scale: fn(i64) -> i64) -> CommandResult {
        let [key] = exact::<1>(name, args)?;
        let reply = match self.storage.pttl(bytes(key)?) {
            None => -2,
            Some(-1) => -1,
            Some(ms) => scale(ms),
        };
        Ok(RespValue::integer(reply))
    }

    fn persist(&self, args: &[RespValue]) -> CommandResult {
        let [key] = exact::<1>("PERSIST", args)?;
        Ok(RespValue::integer(self.storage.persist(bytes(key)?) as i64))
    }

    fn keys(&self, args: &[RespValue]) -> CommandResult {
        let [pattern] = exact::<1>("KEYS", args)?;
        let keys = self.storage.keys(bytes(pattern)?);
        Ok(RespValue::array(
            keys.into_iter().map(RespValue::bulk_string).collect(),
        ))
    }

    fn ping(&self, args: &[RespValue]) -> CommandResult {
        match args {
            [] => Ok(RespValue::pong()),
            [message] => Ok(RespValue::bulk_string(owned_bytes(message)?)),
            _ => Err(CommandError::Arity("PING")),
        }
    }

    fn echo(&self, args: &[RespValue]) -> CommandResult {
        let [message] = exact::<1>("ECHO", args)?;
        Ok(RespValue::bulk_string(owned_bytes(message)?))
    }

    fn info(&self) -> RespValue {
        let stats = self.storage.stats();
        let info = format!(
            "# Server\r\n\
             kvreactor_version:{}\r\n\
             os:{}\r\n\
             uptime_in_seconds:{}\r\n\
             \r\n\
             # Stats\r\n\
             total_commands_processed:{}\r\n\
             get_ops:{}\r\n\
             set_ops:{}\r\n\
             del_ops:{}\r\n\
             expired_keys:{}\r\n\
             \r\n\
             # Memory\r\n\
             used_memory:{}\r\n\
             \r\n\
             # Keyspace\r\n\
             db0:keys={}\r\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            self.start_time.elapsed().as_secs(),
            self.commands_processed(),
            stats.get_ops,
            stats.set_ops,
            stats.del_ops,
            stats.expired,
            self.storage.used_memory(),
            stats.keys,
        );
        RespValue::bulk_string(Bytes::from(info))
    }

    /// DEBUG SLEEP seconds. Blocks the calling thread, which is what makes it
    /// useful for exercising asynchronous completion.
    fn debug(&self, args: &[RespValue]) -> CommandResult {
        let (sub, rest) = args.split_first().ok_or(CommandError::Arity("DEBUG"))?;
        let sub = sub.as_str().ok_or(CommandError::Syntax)?.to_ascii_uppercase();
        match (sub.as_str(), rest) {
            ("SLEEP", [seconds]) => {
                let seconds: f64 = seconds
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .filter(|s: &f64| s.is_finite() && *s >= 0.0)
                    .ok_or(CommandError::NotAnInteger)?;
                std::thread::sleep(Duration::from_secs_f64(seconds));
                Ok(RespValue::ok())
            }
            ("SLEEP", _) => Err(CommandError::Arity("DEBUG")),
            _ => Err(CommandError::Syntax),
        }
    }
}

fn time() -> RespValue {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    RespValue::array(vec![
        RespValue::bulk_string(Bytes::from(now.as_secs().to_string())),
        RespValue::bulk_string(Bytes::from(now.subsec_micros().to_string())),
    ])
}

/// Checks the argument count and hands the arguments out by position.
fn exact<'a, const N: usize>(
    name: &'static str,
    args: &'a [RespValue],
) -> Result<&'a [RespValue; N], CommandError> {
    args.try_into().map_err(|_| CommandError::Arity(name))
}

fn bytes(value: &RespValue) -> Result<&[u8], CommandError> {
    value.as_bytes().ok_or(CommandError::Format)
}

fn owned_bytes(value: &RespValue) -> Result<Bytes, CommandError> {
    match value {
        RespValue::BulkString(b) => Ok(b.clone()),
        RespValue::SimpleString(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        _ => Err(CommandError::Format),
    }
}

fn integer(value: &RespValue) -> Result<i64, CommandError> {
    match value {
        RespValue::Integer(n) => Ok(*n),
        other => other
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or(CommandError::NotAnInteger),
    }
}

fn positive(n: i64, name: &'static str) -> Result<u64, CommandError> {
    if n > 0 {
        Ok(n as u64)
    } else {
        Err(CommandError::InvalidExpire(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_handler() -> CommandHandler {
        CommandHandler::new(Arc::new(StorageEngine::new()))
    }

    fn make_command(args: &[&str]) -> RespValue {
        RespValue::array(
            args.iter()
                .map(|s| RespValue::bulk_string(Bytes::from(s.to_string())))
                .collect(),
        )
    }

    fn run(handler: &CommandHandler, args: &[&str]) -> RespValue {
        handler.execute(make_command(args))
    }

    #[test]
    fn test_ping_and_echo() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["PING"]), RespValue::pong());
        assert_eq!(run(&handler, &["ping", "hi"]), RespValue::bulk_string("hi"));
        assert_eq!(run(&handler, &["ECHO", "hello"]), RespValue::bulk_string("hello"));
        assert!(run(&handler, &["ECHO"]).is_error());
    }

    #[test]
    fn test_set_get() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["SET", "key", "value"]), RespValue::ok());
        assert_eq!(run(&handler, &["GET", "key"]), RespValue::bulk_string("value"));
        assert_eq!(run(&handler, &["GET", "missing"]), RespValue::null());
    }

    #[test]
    fn test_set_with_options() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["SET", "k", "v", "NX"]), RespValue::ok());
        assert_eq!(run(&handler, &["SET", "k", "v2", "NX"]), RespValue::null());
        assert_eq!(run(&handler, &["SET", "k", "v3", "XX"]), RespValue::ok());
        assert_eq!(run(&handler, &["SET", "other", "v", "XX"]), RespValue::null());

        assert_eq!(run(&handler, &["SET", "t", "v", "EX", "100"]), RespValue::ok());
        assert_eq!(run(&handler, &["TTL", "t"]), RespValue::integer(100));

        assert_eq!(
            run(&handler, &["SET", "t", "v", "EX", "0"]),
            RespValue::error("ERR invalid expire time in 'SET' command")
        );
        assert_eq!(
            run(&handler, &["SET", "t", "v", "NX", "XX"]),
            RespValue::error("ERR syntax error")
        );
        assert_eq!(
            run(&handler, &["SET", "t", "v", "PX"]),
            RespValue::error("ERR syntax error")
        );
    }

    #[test]
    fn test_counters() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["INCR", "n"]), RespValue::integer(1));
        assert_eq!(run(&handler, &["INCRBY", "n", "10"]), RespValue::integer(11));
        assert_eq!(run(&handler, &["DECR", "n"]), RespValue::integer(10));
        assert_eq!(run(&handler, &["DECRBY", "n", "20"]), RespValue::integer(-10));

        run(&handler, &["SET", "s", "abc"]);
        assert_eq!(
            run(&handler, &["INCR", "s"]),
            RespValue::error("ERR value is not an integer or out of range")
        );
        assert_eq!(
            run(&handler, &["INCRBY", "n", "x"]),
            RespValue::error("ERR value is not an integer or out of range")
        );
    }

    #[test]
    fn test_multi_key_commands() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["MSET", "k1", "v1", "k2", "v2"]), RespValue::ok());
        assert_eq!(
            run(&handler, &["MGET", "k1", "k2", "k3"]),
            RespValue::array(vec![
                RespValue::bulk_string("v1"),
                RespValue::bulk_string("v2"),
                RespValue::null(),
            ])
        );
        assert_eq!(run(&handler, &["EXISTS", "k1", "k2", "k3"]), RespValue::integer(2));
        assert_eq!(run(&handler, &["DEL", "k1", "k3"]), RespValue::integer(1));
        assert!(run(&handler, &["MSET", "k1"]).is_error());
    }

    #[test]
    fn test_append_strlen() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["APPEND", "k", "Hello"]), RespValue::integer(5));
        assert_eq!(run(&handler, &["APPEND", "k", " World"]), RespValue::integer(11));
        assert_eq!(run(&handler, &["STRLEN", "k"]), RespValue::integer(11));
    }

    #[test]
    fn test_expiry_commands() {
        let handler = create_handler();
        assert_eq!(run(&handler, &["TTL", "k"]), RespValue::integer(-2));
        run(&handler, &["SET", "k", "v"]);
        assert_eq!(run(&handler, &["TTL", "k"]), RespValue::integer(-1));

        assert_eq!(run(&handler, &["PEXPIRE", "k", "50000"]), RespValue::integer(1));
        assert_eq!(run(&handler, &["TTL", "k"]), RespValue::integer(50));
        assert_eq!(run(&handler, &["PERSIST", "k"]), RespValue::integer(1));
        assert_eq!(run(&handler, &["PTTL", "k"]), RespValue::integer(-1));

        assert_eq!(run(&handler, &["EXPIRE", "k", "0"]), RespValue::integer(1));
        assert_eq!(run(&handler, &["GET", "k"]), RespValue::null());
        assert_eq!(run(&handler, &["EXPIRE", "missing", "10"]), RespValue::integer(0));
    }

    #[test]
    fn test_keys_dbsize_flush() {
        let handler = create_handler();
        run(&handler, &["MSET", "user:1", "a", "user:2", "b", "other", "c"]);
        assert_eq!(run(&handler, &["DBSIZE"]), RespValue::integer(3));

        let keys = run(&handler, &["KEYS", "user:*"]);
        assert_eq!(keys.as_array().map(|k| k.len()), Some(2));

        assert_eq!(run(&handler, &["FLUSHALL"]), RespValue::ok());
        assert_eq!(run(&handler, &["DBSIZE"]), RespValue::integer(0));
    }

    #[test]
    fn test_server_commands() {
        let handler = create_handler();
        let info = run(&handler, &["INFO"]);
        assert!(info.as_str().is_some_and(|s| s.contains("total_commands_processed:1")));

        let time = run(&handler, &["TIME"]);
        assert_eq!(time.as_array().map(|t| t.len()), Some(2));

        let commands = run(&handler, &["COMMAND"]);
        assert_eq!(commands.as_array().map(|c| c.len()), Some(COMMAND_NAMES.len()));
        assert_eq!(run(&handler, &["QUIT"]), RespValue::ok());
        assert_eq!(handler.commands_processed(), 4);
    }

    #[test]
    fn test_debug_sleep() {
        let handler = create_handler();
        let start = Instant::now();
        assert_eq!(run(&handler, &["DEBUG", "SLEEP", "0.05"]), RespValue::ok());
        assert!(start.elapsed() >= Duration::from_millis(50));

        assert!(run(&handler, &["DEBUG", "SLEEP", "-1"]).is_error());
        assert!(run(&handler, &["DEBUG", "SLEEP"]).is_error());
        assert!(run(&handler, &["DEBUG", "RELOAD"]).is_error());
    }

    #[test]
    fn test_malformed_requests() {
        let handler = create_handler();
        assert_eq!(
            run(&handler, &["NOPE"]),
            RespValue::error("ERR unknown command 'NOPE'")
        );
        assert_eq!(
            handler.execute(RespValue::integer(1)),
            RespValue::error("ERR invalid command format")
        );
        assert_eq!(
            handler.execute(RespValue::array(vec![])),
            RespValue::error("ERR invalid command format")
        );
        assert_eq!(
            run(&handler, &["GET"]),
            RespValue::error("ERR wrong number of arguments for 'GET' command")
        );
    }

    #[test]
    fn test_command_name() {
        assert_eq!(command_name(&make_command(&["get", "k"])), Some("GET".to_string()));
        assert_eq!(command_name(&RespValue::integer(1)), None);
        assert_eq!(command_name(&RespValue::array(vec![])), None);
    }
}
