use clap::Parser;
use std::io::{self, BufRead, Write};
use tracing::info;
use yari::protocol::command::parse_line;
use yari::protocol::{Command, CommandCode};
use yari::{trace, Client};

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive yari client", long_about = None)]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 22000)]
    port: u16,

    /// Numeric trace level (-1 errors only, 0 default, 1 and 2 verbose)
    #[arg(long, allow_negative_numbers = true)]
    trace_level: Option<i32>,
}

fn first_word(line: &[u8]) -> String {
    let word = line
        .split(|c| c.is_ascii_whitespace())
        .find(|word| !word.is_empty())
        .unwrap_or_default();
    String::from_utf8_lossy(word).into_owned()
}

fn report_failure(code: CommandCode, line: &[u8]) {
    println!(
        "ERROR : in executing command [{}][{}]",
        code,
        first_word(line)
    );
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = args
        .trace_level
        .or_else(trace::level_from_env)
        .unwrap_or(0);
    trace::init(level)?;

    let mut client = Client::connect((args.host.as_str(), args.port))?;
    info!("connected to yari at {}", client.peer_addr()?);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = Vec::new();

    loop {
        print!("yari > ");
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_until(b'\n', &mut line)? == 0 {
            break;
        }

        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(rejected) => {
                report_failure(rejected.code, &line);
                continue;
            }
        };
        let code = command.code();

        let result = match command {
            Command::Quit => break,
            Command::Get(key) => client.get(&key).map(Some),
            Command::Set { key, value } => client.set(&key, &value).map(|_| None),
        };

        match result {
            Ok(Some(value)) if !value.is_empty() => {
                println!("{}", String::from_utf8_lossy(&value))
            }
            Ok(_) => println!("OK"),
            Err(e) if e.is_fatal_io() => {
                println!("ERROR : {}", e);
                break;
            }
            Err(_) => report_failure(code, &line),
        }
    }

    println!("Disconnected from Yari");

    Ok(())
}
