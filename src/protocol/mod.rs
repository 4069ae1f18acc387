pub mod codec;
pub mod command;

pub use command::{Command, CommandCode, CommandExecutor};
