use bytes::Bytes;
use std::fmt;

mod client;
mod executor;
mod parser;

pub use client::{request_get, request_set};
pub use executor::CommandExecutor;
pub use parser::{parse_line, Rejected};

/// Numeric command identifiers carried in the leading frame token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Get,
    Set,
    /// Client side only, never sent on the wire
    Quit,
    Unknown,
}

impl CommandCode {
    pub const GET: u64 = 1;
    pub const SET: u64 = 2;
    pub const QUIT: u64 = 101;
    pub const UNKNOWN: u64 = 999;

    pub fn from_code(code: u64) -> Self {
        match code {
            Self::GET => CommandCode::Get,
            Self::SET => CommandCode::Set,
            Self::QUIT => CommandCode::Quit,
            _ => CommandCode::Unknown,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            CommandCode::Get => Self::GET,
            CommandCode::Set => Self::SET,
            CommandCode::Quit => Self::QUIT,
            CommandCode::Unknown => Self::UNKNOWN,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Command typed at the interactive client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(Vec<u8>),
    Set { key: Vec<u8>, value: Bytes },
    Quit,
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::Get(_) => CommandCode::Get,
            Command::Set { .. } => CommandCode::Set,
            Command::Quit => CommandCode::Quit,
        }
    }
}
