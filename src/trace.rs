//! Logging setup.
//!
//! Lines look like `<monotonic-us>-<os-tid>-<thread-index>-<ERROR:|> message`.

use crate::sync::current_thread_id;
use std::cell::Cell;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Environment variable holding the numeric trace level
pub const LEVEL_ENV: &str = "YTRACE_LEVEL";

/// Map a numeric trace level onto a tracing filter.
///
/// `-1` and below keeps errors only, `0` is the default, `1` and `2` are
/// increasingly verbose.
pub fn level_filter(level: i32) -> LevelFilter {
    match level {
        i32::MIN..=-1 => LevelFilter::ERROR,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Numeric trace level from the environment, if set and well formed.
pub fn level_from_env() -> Option<i32> {
    std::env::var(LEVEL_ENV).ok()?.trim().parse().ok()
}

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init(level: i32) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(TraceFormat)
        .try_init()
        .map_err(anyhow::Error::msg)
}

/// Event formatter producing the trace line layout
pub struct TraceFormat;

impl<S, N> FormatEvent<S, N> for TraceFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let marker = if *event.metadata().level() == Level::ERROR {
            "ERROR:"
        } else {
            ""
        };

        write!(
            writer,
            "{}-{}-{}-{} ",
            monotonic_micros(),
            os_tid(),
            current_thread_id(),
            marker
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

thread_local! {
    static OS_TID: Cell<i64> = const { Cell::new(0) };
}

fn os_tid() -> i64 {
    OS_TID.with(|tid| {
        if tid.get() == 0 {
            tid.set(fetch_os_tid());
        }
        tid.get()
    })
}

#[cfg(target_os = "linux")]
fn fetch_os_tid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[cfg(not(target_os = "linux"))]
fn fetch_os_tid() -> i64 {
    std::process::id() as i64
}
