//! # Logging Setup
//!
//! Tracing support for the bus engine. Provides a custom event formatter
//! that tints whole log lines by severity, plus an opt-in subscriber
//! initializer used by examples and integration tests. Library code never
//! installs a global subscriber on its own; it only emits `tracing` events.

use colored::Colorize;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A tracing event formatter that colors each line by its level.
///
/// The engine logs connection ids and message cookies as plain fields; a
/// whole-line tint is enough to scan interleaved multi-connection traces
/// without per-field markup.
pub struct LevelTintFormatter;

impl<S, N> FormatEvent<S, N> for LevelTintFormatter
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
        // Buffer the formatted fields so the color applies to the entire
        // line, target included.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        write!(buf_writer, "{} ", event.metadata().target())?;
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::ERROR => buffer.red(),
            Level::WARN => buffer.yellow(),
            Level::INFO => buffer.white(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Install a global subscriber honouring `RUST_LOG`, tinted per level.
///
/// Intended for tests and examples; calling it twice is harmless (the
/// second installation attempt is ignored).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(LevelTintFormatter)
        .try_init();
}
