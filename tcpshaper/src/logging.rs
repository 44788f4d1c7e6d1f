use time::macros::format_description;
use time::UtcOffset;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Full timestamps for log files and journals, a compact colored layout
/// when someone is watching the terminal.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcpshaper=info"));
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let (full, compact) = if console::user_attended() {
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_timer(OffsetTime::new(
                offset,
                format_description!("[hour]:[minute]:[second]"),
            ));
        (None, Some(layer))
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_timer(OffsetTime::new(
                offset,
                format_description!("[day].[month].[year] [hour]:[minute]:[second]"),
            ));
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(full)
        .with(compact)
        .init();
}
