use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Installs the global subscriber.
///
/// With `dir` set, events go to a daily rolling `absum.log` under that
/// directory (and to stderr as well when `alsologtostderr` is true). The
/// returned guard flushes the file writer on drop, so keep it alive in `main`.
pub fn init_tracing(dir: Option<&str>, alsologtostderr: bool) -> Option<WorkerGuard> {
    let builder = tracing_subscriber::fmt();
    let format = tracing_subscriber::fmt::format()
        .with_line_number(true)
        .with_thread_names(true)
        .compact();
    match dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "absum.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            if alsologtostderr {
                builder
                    .with_writer(non_blocking.and(std::io::stderr))
                    .event_format(format)
                    .init();
            } else {
                builder
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(format)
                    .init();
            }
            Some(guard)
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .event_format(format)
                .init();
            None
        }
    }
}
