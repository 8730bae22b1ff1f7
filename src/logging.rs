//! Logger construction

use slog::{o, Drain, Logger};

/// Terminal logger at the given minimum level.
pub fn create_logger(level: slog::Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Logger that drops everything.
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Plain stdout logger used by tests.
pub fn create_test_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
