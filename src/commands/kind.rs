/// Coarse classification of a command, counted per sampled I/O unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Reads the keyspace
    Read,
    /// Modifies the keyspace
    Write,
    /// Connection and server commands, and anything unknown
    Admin,
}

impl CommandKind {
    /// Classifies an upper-cased command name.
    pub fn of(name: &str) -> CommandKind {
        match name {
            "GET" | "MGET" | "EXISTS" | "STRLEN" | "TTL" | "PTTL" | "KEYS" | "DBSIZE" => {
                CommandKind::Read
            }
            "SET" | "DEL" | "INCR" | "INCRBY" | "DECR" | "DECRBY" | "APPEND" | "MSET"
            | "EXPIRE" | "PEXPIRE" | "PERSIST" | "FLUSHDB" | "FLUSHALL" => CommandKind::Write,
            _ => CommandKind::Admin,
        }
    }
}
