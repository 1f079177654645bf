//! Custom logging formatter with hostname and rank prefix and no ANSI colors
//!
//! This module provides a custom tracing formatter that:
//! - Adds `[hostname:rank]` prefix to each log line
//! - Removes ANSI color codes for file output
//! - Shows the enclosing spans on the same line, outermost first
//! - Includes file location and line numbers
//!
//! When ranks are simulated as threads of one process, each thread can
//! label its own lines with [`set_thread_rank`].

use std::cell::Cell;
use std::fmt;

use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

thread_local! {
    static THREAD_RANK: Cell<Option<i32>> = const { Cell::new(None) };
}

/// Label log lines emitted by the current thread with `rank`
pub fn set_thread_rank(rank: i32) {
    THREAD_RANK.with(|r| r.set(Some(rank)));
}

/// Custom event formatter with hostname and rank prefix
pub struct RankFormatter {
    hostname: String,
    rank: Option<i32>,
}

impl RankFormatter {
    pub fn new(rank: Option<i32>) -> Self {
        let hostname = gethostname::gethostname()
            .to_str()
            .unwrap_or("unknown")
            .to_string();
        Self { hostname, rank }
    }

    fn prefix(&self) -> String {
        match THREAD_RANK.with(Cell::get).or(self.rank) {
            Some(rank) => format!("[{}:{}]", self.hostname, rank),
            None => format!("[{}]", self.hostname),
        }
    }
}

impl Default for RankFormatter {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Current UTC time with microseconds
fn timestamp() -> String {
    let now: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
    now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// `outer{fields}:inner{fields}: ` for the spans enclosing the event
fn write_scope<S, N>(ctx: &FmtContext<'_, S, N>, writer: &mut Writer<'_>) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };
    for span in scope.from_root() {
        write!(writer, "{}", span.name())?;
        let ext = span.extensions();
        if let Some(fields) = ext.get::<FormattedFields<N>>() {
            if !fields.is_empty() {
                write!(writer, "{{{}}}", fields)?;
            }
        }
        write!(writer, ":")?;
    }
    write!(writer, " ")
}

/// `target (file:line)`, or just the target when the location is unknown
fn location(meta: &Metadata<'_>) -> String {
    match (meta.file(), meta.line()) {
        (Some(file), Some(line)) => format!("{} ({}:{})", meta.target(), file, line),
        _ => meta.target().to_string(),
    }
}

impl<S, N> FormatEvent<S, N> for RankFormatter
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
        let meta = event.metadata();
        write!(
            writer,
            "{} {} {:5} {}: ",
            self.prefix(),
            timestamp(),
            meta.level(),
            location(meta)
        )?;
        write_scope(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize tracing with the rank formatter
///
/// `RUST_LOG` overrides `level`. Calling this more than once is harmless;
/// only the first subscriber is installed.
pub fn init_with_rank(level: &str, rank: Option<i32>) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .event_format(RankFormatter::new(rank))
        .with_writer(std::io::stdout);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        let hostname_os = gethostname::gethostname();
        let hostname = hostname_os.to_str().unwrap_or("unknown");
        tracing::info!("Logging initialized on host: {} (rank {:?})", hostname, rank);
    }
}
