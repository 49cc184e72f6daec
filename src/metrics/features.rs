use crate::commands::CommandKind;
use std::fmt;

/// Which side of the socket a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkOperatingUnit {
    Invalid = 0,
    Read = 1,
    Write = 2,
}

impl NetworkOperatingUnit {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed-layout feature record for one network operating unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkFeatures {
    pub operating_unit: NetworkOperatingUnit,
    /// Bytes moved by the sampled I/O call
    pub bytes: u64,
    /// Commands decoded since the record was armed
    pub num_queries: u64,
    pub num_reads: u64,
    pub num_writes: u64,
    pub num_admin: u64,
    /// Time spent inside the I/O call, in microseconds
    pub elapsed_us: u64,
}

impl NetworkFeatures {
    /// An empty record for `unit`, ready to count.
    pub fn armed(operating_unit: NetworkOperatingUnit) -> Self {
        Self {
            operating_unit,
            bytes: 0,
            num_queries: 0,
            num_reads: 0,
            num_writes: 0,
            num_admin: 0,
            elapsed_us: 0,
        }
    }

    /// Counts one decoded command.
    pub fn count(&mut self, kind: CommandKind) {
        self.num_queries += 1;
        match kind {
            CommandKind::Read => self.num_reads += 1,
            CommandKind::Write => self.num_writes += 1,
            CommandKind::Admin => self.num_admin += 1,
        }
    }

    /// True when the record covers exactly one command and may be emitted.
    pub fn is_attributable(&self) -> bool {
        self.num_queries == 1
    }

    /// Clears all counters, keeping the operating unit.
    pub fn rearm(&mut self) {
        *self = Self::armed(self.operating_unit);
    }
}

impl fmt::Display for NetworkFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}, {}",
            self.operating_unit.as_u8(),
            self.num_queries,
            self.num_reads,
            self.num_writes,
            self.num_admin,
            self.bytes,
            self.elapsed_us
        )
    }
}
