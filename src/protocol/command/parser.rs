use super::{Command, CommandCode};
use bytes::Bytes;

/// Line the interactive grammar could not turn into a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub code: CommandCode,
    /// First token of the line, empty for a blank line
    pub token: Vec<u8>,
}

#[inline]
fn is_ws(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n')
}

fn tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|c| is_ws(*c)).filter(|tok| !tok.is_empty())
}

/// Map the first token of a typed line onto a command code.
///
/// Anything starting with `g` is a GET, even `gx` or `goat`. `SET` must
/// match exactly (ignoring case) and anything starting with `q` quits.
pub fn command_code(token: &[u8]) -> CommandCode {
    match token.first().map(u8::to_ascii_lowercase) {
        Some(b'g') => CommandCode::Get,
        Some(b's') if token.eq_ignore_ascii_case(b"SET") => CommandCode::Set,
        Some(b'q') => CommandCode::Quit,
        _ => CommandCode::Unknown,
    }
}

/// Parse one line of the human-typed grammar: `get <key>`, `set <key> <value>`
/// or `quit`. Extra tokens are ignored.
pub fn parse_line(line: &[u8]) -> Result<Command, Rejected> {
    let mut tokens = tokens(line);

    let Some(first) = tokens.next() else {
        return Err(Rejected {
            code: CommandCode::Unknown,
            token: Vec::new(),
        });
    };

    let code = command_code(first);
    let rejected = || Rejected {
        code,
        token: first.to_vec(),
    };

    match code {
        CommandCode::Get => {
            let key = tokens.next().ok_or_else(rejected)?;
            Ok(Command::Get(key.to_vec()))
        }
        CommandCode::Set => {
            let key = tokens.next().ok_or_else(rejected)?;
            let value = tokens.next().ok_or_else(rejected)?;
            Ok(Command::Set {
                key: key.to_vec(),
                value: Bytes::copy_from_slice(value),
            })
        }
        CommandCode::Quit => Ok(Command::Quit),
        CommandCode::Unknown => Err(rejected()),
    }
}
